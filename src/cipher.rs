//! Passphrase management for encrypted databases
//!
//! Encryption is provided by SQLCipher when the crate is built with the
//! `sqlcipher` feature. Every connection is keyed before any other statement
//! runs: the `key` pragma and the cipher parameters are applied by SQLx ahead
//! of its other pragmas, then opening touches `sqlite_master`. With a wrong or
//! missing passphrase that read fails with `SQLITE_NOTADB`, so the error
//! surfaces at open rather than on the first query.
//!
//! Without the feature, [`NoEncryption`] stands in and passphrase changes
//! fail with [`Error::EncryptionUnavailable`](crate::Error::EncryptionUnavailable).

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::SqliteConnectOptions;

#[cfg(feature = "sqlcipher")]
use parking_lot::RwLock;
#[cfg(feature = "sqlcipher")]
use tracing::debug;
#[cfg(feature = "sqlcipher")]
use zeroize::Zeroizing;

use crate::Result;
use crate::config::Configuration;
use crate::connection::Connection;
use crate::error::Error;

/// Key derivation and page parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CipherParameters {
   /// SQLCipher's defaults for the linked major version.
   #[default]
   Default,
   /// Settings of an older SQLCipher major version (`cipher_compatibility`).
   Compatibility(u32),
   /// Explicit page size and PBKDF2 iteration count.
   Custom {
      page_size: Option<u32>,
      kdf_iterations: Option<u32>,
   },
}

/// Where the salt of a database with a plaintext header comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaltSource {
   /// Salt bytes stored by the application, usually 16.
   Explicit(Vec<u8>),
   /// The passphrase is raw key data (`x'<key><salt>'`) that carries the salt.
   RawKeyDataWithExplicitSalt,
}

/// Leaves the first bytes of the file unencrypted.
///
/// Some platforms inspect the SQLite header to decide whether a file is a
/// database. SQLCipher then cannot store its salt in the header, so it has to
/// be provided on every open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnencryptedHeader {
   /// Default: 32
   pub length: u32,
   pub salt: SaltSource,
}

impl UnencryptedHeader {
   pub fn new(salt: SaltSource) -> Self {
      Self { length: 32, salt }
   }
}

/// Passphrase and parameters of an encrypted database.
pub struct CipherConfiguration {
   pub passphrase: SecretString,
   pub parameters: CipherParameters,
   pub unencrypted_header: Option<UnencryptedHeader>,
}

impl CipherConfiguration {
   pub fn new(passphrase: impl Into<String>) -> Self {
      Self {
         passphrase: SecretString::from(passphrase.into()),
         parameters: CipherParameters::Default,
         unencrypted_header: None,
      }
   }

   pub fn with_parameters(mut self, parameters: CipherParameters) -> Self {
      self.parameters = parameters;
      self
   }

   pub fn with_unencrypted_header(mut self, header: UnencryptedHeader) -> Self {
      self.unencrypted_header = Some(header);
      self
   }
}

impl Clone for CipherConfiguration {
   fn clone(&self) -> Self {
      Self {
         passphrase: clone_secret(&self.passphrase),
         parameters: self.parameters,
         unencrypted_header: self.unencrypted_header.clone(),
      }
   }
}

impl fmt::Debug for CipherConfiguration {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("CipherConfiguration")
         .field("passphrase", &"[REDACTED]")
         .field("parameters", &self.parameters)
         .field("unencrypted_header", &self.unencrypted_header)
         .finish()
   }
}

pub(crate) fn clone_secret(secret: &SecretString) -> SecretString {
   SecretString::from(secret.expose_secret().to_owned())
}

/// Keys new connections and rotates the passphrase of open ones.
///
/// One manager is shared by every connection of a queue or pool, so a
/// passphrase recorded with [`set_passphrase`](Self::set_passphrase) is used by
/// every connection opened afterwards.
pub trait EncryptionManager: Send + Sync + fmt::Debug {
   /// True when connections are keyed.
   fn is_enabled(&self) -> bool;

   /// Adds the key and cipher pragmas to the options of a fresh connection.
   fn configure(&self, options: SqliteConnectOptions) -> SqliteConnectOptions;

   /// Re-encrypts the database of `conn` with `passphrase`.
   fn rekey<'c>(
      &'c self,
      conn: &'c mut Connection,
      passphrase: &'c SecretString,
   ) -> BoxFuture<'c, Result<()>>;

   /// Records the passphrase used to key future connections.
   fn set_passphrase(&self, passphrase: SecretString) -> Result<()>;
}

/// Manager of builds without SQLCipher.
#[derive(Debug, Default)]
pub struct NoEncryption;

impl EncryptionManager for NoEncryption {
   fn is_enabled(&self) -> bool {
      false
   }

   fn configure(&self, options: SqliteConnectOptions) -> SqliteConnectOptions {
      options
   }

   fn rekey<'c>(
      &'c self,
      _conn: &'c mut Connection,
      _passphrase: &'c SecretString,
   ) -> BoxFuture<'c, Result<()>> {
      Box::pin(async { Err(Error::EncryptionUnavailable) })
   }

   fn set_passphrase(&self, _passphrase: SecretString) -> Result<()> {
      Err(Error::EncryptionUnavailable)
   }
}

/// SQLCipher-backed manager.
///
/// Holds the cipher configuration the queue or pool was opened with. A
/// manager created without one leaves connections unkeyed and refuses to
/// change the passphrase.
#[cfg(feature = "sqlcipher")]
pub struct SqlCipher {
   state: RwLock<Option<CipherConfiguration>>,
}

#[cfg(feature = "sqlcipher")]
impl SqlCipher {
   pub fn new(cipher: Option<CipherConfiguration>) -> Self {
      Self {
         state: RwLock::new(cipher),
      }
   }
}

#[cfg(feature = "sqlcipher")]
impl fmt::Debug for SqlCipher {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("SqlCipher")
         .field("enabled", &self.is_enabled())
         .finish()
   }
}

#[cfg(feature = "sqlcipher")]
impl EncryptionManager for SqlCipher {
   fn is_enabled(&self) -> bool {
      self.state.read().is_some()
   }

   fn configure(&self, options: SqliteConnectOptions) -> SqliteConnectOptions {
      let state = self.state.read();
      let Some(cipher) = state.as_ref() else {
         return options;
      };

      let key = quote_literal(cipher.passphrase.expose_secret());
      let mut options = options.pragma("key", key.as_str().to_owned());

      options = match cipher.parameters {
         CipherParameters::Default => options,
         CipherParameters::Compatibility(version) => {
            options.pragma("cipher_compatibility", version.to_string())
         }
         CipherParameters::Custom {
            page_size,
            kdf_iterations,
         } => {
            if let Some(page_size) = page_size {
               options = options.pragma("cipher_page_size", page_size.to_string());
            }
            if let Some(kdf_iterations) = kdf_iterations {
               options = options.pragma("kdf_iter", kdf_iterations.to_string());
            }
            options
         }
      };

      if let Some(header) = &cipher.unencrypted_header {
         options = options.pragma("cipher_plaintext_header_size", header.length.to_string());
         if let SaltSource::Explicit(salt) = &header.salt {
            options = options.pragma("cipher_salt", format!("\"x'{}'\"", hex::encode(salt)));
         }
      }

      options
   }

   fn rekey<'c>(
      &'c self,
      conn: &'c mut Connection,
      passphrase: &'c SecretString,
   ) -> BoxFuture<'c, Result<()>> {
      Box::pin(async move {
         if !self.is_enabled() {
            return Err(Error::EncryptionNotConfigured);
         }

         let pragma = Zeroizing::new(format!(
            "PRAGMA rekey = {}",
            quote_literal(passphrase.expose_secret()).as_str()
         ));

         // Not persistent: the statement text holds the key and must not stay
         // in the statement cache. Errors are not wrapped with the SQL either.
         sqlx::query(pragma.as_str())
            .persistent(false)
            .execute(&mut **conn)
            .await?;

         debug!(connection = %conn.name(), "Database rekeyed");
         Ok(())
      })
   }

   fn set_passphrase(&self, passphrase: SecretString) -> Result<()> {
      let mut state = self.state.write();
      match state.as_mut() {
         Some(cipher) => {
            cipher.passphrase = passphrase;
            Ok(())
         }
         None => Err(Error::EncryptionNotConfigured),
      }
   }
}

/// Manager matching the build and the configuration.
pub(crate) fn manager_for(config: &Configuration) -> Arc<dyn EncryptionManager> {
   #[cfg(feature = "sqlcipher")]
   {
      Arc::new(SqlCipher::new(config.cipher.clone()))
   }
   #[cfg(not(feature = "sqlcipher"))]
   {
      let _ = config;
      Arc::new(NoEncryption)
   }
}

/// Single-quoted SQL literal.
#[cfg(feature = "sqlcipher")]
fn quote_literal(value: &str) -> Zeroizing<String> {
   let escaped = Zeroizing::new(value.replace('\'', "''"));
   Zeroizing::new(format!("'{}'", escaped.as_str()))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_debug_redacts_passphrase() {
      let cipher = CipherConfiguration::new("hunter2");
      let printed = format!("{:?}", cipher);
      assert!(!printed.contains("hunter2"));
      assert!(printed.contains("REDACTED"));
   }

   #[test]
   fn test_clone_keeps_passphrase() {
      let cipher = CipherConfiguration::new("secret")
         .with_parameters(CipherParameters::Compatibility(3))
         .with_unencrypted_header(UnencryptedHeader::new(SaltSource::Explicit(vec![1; 16])));
      let copy = cipher.clone();

      assert_eq!(copy.passphrase.expose_secret(), "secret");
      assert_eq!(copy.parameters, CipherParameters::Compatibility(3));
      assert_eq!(copy.unencrypted_header.map(|h| h.length), Some(32));
   }

   #[test]
   fn test_no_encryption_refuses_passphrase() {
      let manager = NoEncryption;
      assert!(!manager.is_enabled());
      assert!(matches!(
         manager.set_passphrase(SecretString::from("x".to_string())),
         Err(Error::EncryptionUnavailable)
      ));
   }

   #[cfg(feature = "sqlcipher")]
   #[test]
   fn test_quote_literal_escapes_quotes() {
      assert_eq!(quote_literal("it's").as_str(), "'it''s'");
      assert_eq!(quote_literal("plain").as_str(), "'plain'");
   }

   #[cfg(feature = "sqlcipher")]
   #[test]
   fn test_sqlcipher_without_configuration() {
      let manager = SqlCipher::new(None);
      assert!(!manager.is_enabled());
      assert!(matches!(
         manager.set_passphrase(SecretString::from("x".to_string())),
         Err(Error::EncryptionNotConfigured)
      ));
   }

   #[cfg(feature = "sqlcipher")]
   #[test]
   fn test_sqlcipher_records_passphrase() {
      let manager = SqlCipher::new(Some(CipherConfiguration::new("old")));
      manager
         .set_passphrase(SecretString::from("new".to_string()))
         .unwrap();
      let state = manager.state.read();
      assert_eq!(
         state.as_ref().unwrap().passphrase.expose_secret(),
         "new"
      );
   }
}
