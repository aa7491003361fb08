//! Admin API key check.

use subtle::ConstantTimeEq;

use meterline_shared::error::ServiceError;

use crate::messages;

/// Wraps the configured admin key; comparison is constant-time.
#[derive(Clone)]
pub struct AdminKey {
    key: Vec<u8>,
}

impl AdminKey {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    pub fn check(&self, provided: Option<&str>) -> Result<(), ServiceError> {
        let Some(provided) = provided else {
            return Err(ServiceError::forbidden(messages::MISSING_ADMIN_KEY));
        };
        let provided = provided.as_bytes();
        // Length is not secret; content comparison is constant-time.
        if provided.len() != self.key.len()
            || provided.ct_eq(&self.key).unwrap_u8() != 1
        {
            return Err(ServiceError::forbidden(messages::INVALID_ADMIN_KEY));
        }
        Ok(())
    }
}
