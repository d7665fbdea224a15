use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to serialize patch value for '{path}': {source}")]
    Serialize {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to serialize patch document: {0}")]
    Document(#[source] serde_json::Error),
}

/// The two operations the defaulters ever emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    /// Target object was absent before mutation.
    Add,
    /// Target object existed and some of its fields were completed.
    Replace,
}

impl PatchOp {
    pub fn for_existing(present: bool) -> Self {
        if present { PatchOp::Replace } else { PatchOp::Add }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatchOp::Add => "add",
            PatchOp::Replace => "replace",
        }
    }
}

/// Ordered, append-only list of JSON Patch operations for one admission request.
#[derive(Debug, Default)]
pub struct PatchSet {
    operations: Vec<PatchOperation>,
}

impl PatchSet {
    pub fn new() -> Self {
        Self {
            operations: Vec::with_capacity(16),
        }
    }

    pub fn append<T: Serialize>(
        &mut self,
        op: PatchOp,
        path: PointerBuf,
        value: &T,
    ) -> Result<(), PatchError> {
        let value = serde_json::to_value(value).map_err(|source| PatchError::Serialize {
            path: path.to_string(),
            source,
        })?;

        self.operations.push(match op {
            PatchOp::Add => PatchOperation::Add(AddOperation { path, value }),
            PatchOp::Replace => PatchOperation::Replace(ReplaceOperation { path, value }),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[PatchOperation] {
        &self.operations
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.operations().iter().filter_map(|op| match op {
            PatchOperation::Add(AddOperation { path, .. })
            | PatchOperation::Replace(ReplaceOperation { path, .. }) => Some(path.as_str()),
            _ => None,
        })
    }

    /// Serializes the operations as a JSON array, `[]` when nothing was appended.
    pub fn to_document(&self) -> Result<Vec<u8>, PatchError> {
        serde_json::to_vec(&self.operations).map_err(PatchError::Document)
    }

    pub fn into_patch(self) -> Patch {
        Patch(self.operations)
    }
}
