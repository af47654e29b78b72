use std::path::Path;

use async_trait::async_trait;
use russh_keys::key;

use crate::error::{MoguraError, MoguraResult};

/// SSH client handler for the bastion session.
///
/// `check_server_key` always accepts, mirroring the teacher's
/// `SSHClientHandler` — host-key verification is a documented,
/// intentionally out-of-scope weakness (see DESIGN.md).
#[derive(Clone)]
pub struct BastionHandler;

#[async_trait]
impl russh::client::Handler for BastionHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Loads the private key at `key_path`, returning the error kinds the spec
/// distinguishes (file-read vs. parse failure).
pub fn load_key(key_path: &Path, passphrase: Option<&str>) -> MoguraResult<key::KeyPair> {
    if !key_path.exists() {
        return Err(MoguraError::KeyFileRead(format!(
            "no such file: {}",
            key_path.display()
        )));
    }

    russh_keys::load_secret_key(key_path, passphrase)
        .map_err(|e| MoguraError::KeyParse(format!("{}: {}", key_path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_key_fails_on_missing_file() {
        let err = load_key(Path::new("/nonexistent/key"), None).unwrap_err();
        assert!(matches!(err, MoguraError::KeyFileRead(_)));
    }
}
