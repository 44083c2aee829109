//! Newtype identifiers.
//!
//! Every identifier in the data model is an opaque 64-bit integer (spec.md
//! §3). Wrapping them distinctly (rather than passing `i64` around)
//! follows the teacher's `EndpointId`/`ProjectId` convention of never
//! letting two different kinds of id be accidentally interchangeable.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(ServiceId);
id_type!(ApiKeyId);
id_type!(MerkleRootId);
