//! Shard items and the source of their secrets.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One item of a shard's `items` array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub secret: Uuid,
}

/// Produces the `secret` of each record.
///
/// Secrets are independent of the id they are paired with.
pub trait SecretSource {
    fn next_secret(&mut self) -> Uuid;
}

/// Fresh random UUID v4 per record.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSecrets;

impl SecretSource for RandomSecrets {
    fn next_secret(&mut self) -> Uuid {
        Uuid::new_v4()
    }
}

impl<S: SecretSource + ?Sized> SecretSource for &mut S {
    fn next_secret(&mut self) -> Uuid {
        (**self).next_secret()
    }
}
