use std::path::PathBuf;

use curl::easy::Form;

/// A single multipart form field.
///
/// Fields are collected while a request is being built and committed to the
/// transfer engine as one form when the request is prepared.
#[derive(Debug, Clone)]
pub enum MimeField {
    /// Inline field with its value carried in memory.
    Value {
        /// Form field name.
        name: String,
        /// Form field value.
        value: String,
    },
    /// File-backed field. The file is streamed from disk when the transfer
    /// actually runs, not when the field is added.
    File {
        /// Form field name, which the receiver sees as the file name.
        name: String,
        /// Path of the file to upload.
        path: PathBuf,
    },
}

impl MimeField {
    pub(crate) fn append_to(&self, form: &mut Form) -> Result<(), curl::FormError> {
        match self {
            MimeField::Value { name, value } => {
                form.part(name).contents(value.as_bytes()).add()
            }
            MimeField::File { name, path } => form.part(name).file(path).add(),
        }
    }
}
