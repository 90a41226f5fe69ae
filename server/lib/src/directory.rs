//! The user directory is the collaborator that the identification and password
//! stages consult. Account storage is not the concern of the flow engine, so it
//! only sees this trait. [`StaticUserDirectory`] serves accounts declared in the
//! server configuration with argon2 password hashes.

use std::collections::BTreeMap;

use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use gatehouse_proto::v1::UserField;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

pub trait UserDirectory: Send + Sync {
    /// Resolve an identifier to the canonical username, matching only the
    /// permitted fields.
    fn lookup(&self, identifier: &str, fields: &[UserField]) -> Option<String>;

    /// Check a password for a canonical username. Unknown users are `Ok(false)`.
    fn verify_password(&self, username: &str, password: &str) -> Result<bool, OperationError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRecord {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    /// An argon2 hash in PHC string format.
    pub password_hash: String,
}

#[derive(Debug, Default)]
pub struct StaticUserDirectory {
    users: BTreeMap<String, UserRecord>,
    emails: BTreeMap<String, String>,
}

impl StaticUserDirectory {
    pub fn new(records: Vec<UserRecord>) -> Result<Self, OperationError> {
        let mut users = BTreeMap::new();
        let mut emails = BTreeMap::new();

        for record in records {
            PasswordHash::new(&record.password_hash).map_err(|e| {
                admin_error!(username = %record.username, ?e, "invalid password hash");
                OperationError::InvalidConfiguration(format!(
                    "user {} has an invalid password hash",
                    record.username
                ))
            })?;

            if let Some(email) = &record.email {
                if emails
                    .insert(email.to_lowercase(), record.username.clone())
                    .is_some()
                {
                    return Err(OperationError::InvalidConfiguration(format!(
                        "email {} is assigned to more than one user",
                        email
                    )));
                }
            }

            let username = record.username.clone();
            if users.insert(username.clone(), record).is_some() {
                return Err(OperationError::InvalidConfiguration(format!(
                    "user {} is defined more than once",
                    username
                )));
            }
        }

        Ok(StaticUserDirectory { users, emails })
    }
}

impl UserDirectory for StaticUserDirectory {
    fn lookup(&self, identifier: &str, fields: &[UserField]) -> Option<String> {
        fields.iter().find_map(|field| match field {
            UserField::Username => self.users.get(identifier).map(|u| u.username.clone()),
            UserField::Email => self.emails.get(&identifier.to_lowercase()).cloned(),
        })
    }

    fn verify_password(&self, username: &str, password: &str) -> Result<bool, OperationError> {
        let Some(record) = self.users.get(username) else {
            return Ok(false);
        };

        let parsed = PasswordHash::new(&record.password_hash).map_err(|e| {
            admin_error!(?e, "stored password hash is not valid PHC");
            OperationError::CryptographyError
        })?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => {
                admin_error!(?e, "password verification failed");
                Err(OperationError::CryptographyError)
            }
        }
    }
}

/// Hash a password for storage in a [`UserRecord`].
pub fn hash_password(password: &str) -> Result<String, OperationError> {
    hash_password_with(&Argon2::default(), password)
}

pub fn hash_password_with(argon2: &Argon2, password: &str) -> Result<String, OperationError> {
    let salt = SaltString::generate(rand::thread_rng());
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            admin_error!(?e, "unable to hash password");
            OperationError::CryptographyError
        })
}

#[cfg(test)]
mod tests {
    use gatehouse_proto::v1::UserField;

    use super::{StaticUserDirectory, UserDirectory, UserRecord};
    use crate::prelude::*;
    use crate::testkit::test_hash;

    fn directory() -> StaticUserDirectory {
        StaticUserDirectory::new(vec![UserRecord {
            username: "alice".to_string(),
            email: Some("Alice@example.com".to_string()),
            password_hash: test_hash("correct horse"),
        }])
        .expect("failed to build directory")
    }

    #[test]
    fn test_directory_lookup_respects_fields() {
        sketching::test_init();
        let dir = directory();

        assert_eq!(
            dir.lookup("alice", &[UserField::Username]),
            Some("alice".to_string())
        );
        assert_eq!(dir.lookup("alice@example.com", &[UserField::Username]), None);
        assert_eq!(
            dir.lookup("alice@EXAMPLE.com", &[UserField::Email]),
            Some("alice".to_string())
        );
        assert_eq!(dir.lookup("bob", &[UserField::Username, UserField::Email]), None);
    }

    #[test]
    fn test_directory_verify_password() {
        sketching::test_init();
        let dir = directory();

        assert_eq!(dir.verify_password("alice", "correct horse"), Ok(true));
        assert_eq!(dir.verify_password("alice", "wrong"), Ok(false));
        assert_eq!(dir.verify_password("bob", "correct horse"), Ok(false));
    }

    #[test]
    fn test_directory_rejects_bad_config() {
        sketching::test_init();
        let bad_hash = StaticUserDirectory::new(vec![UserRecord {
            username: "alice".to_string(),
            email: None,
            password_hash: "plaintext".to_string(),
        }]);
        assert_eq!(
            bad_hash.map(|_| ()),
            Err(OperationError::InvalidConfiguration(String::new()))
        );

        let dup = StaticUserDirectory::new(vec![
            UserRecord {
                username: "alice".to_string(),
                email: None,
                password_hash: test_hash("a"),
            },
            UserRecord {
                username: "alice".to_string(),
                email: None,
                password_hash: test_hash("b"),
            },
        ]);
        assert!(dup.is_err());
    }
}
