//! Identifier newtypes used throughout the mesh.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a random identifier.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::parse_str(s).map_err(Error::from)?;
                Ok(Self::from_uuid(uuid))
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for a worker node participating in the mesh.
    AgentId
}

uuid_id! {
    /// Unique identifier for a unit of work dispatched to an agent.
    JobId
}

uuid_id! {
    /// Identifier minted by the hub for one authenticated session.
    ConnectionId
}

uuid_id! {
    /// Identifier for a pending node enrollment request.
    EnrollmentId
}

uuid_id! {
    /// Serial number stamped into an issued node certificate.
    CertificateSerial
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_agent_id() {
        let id = AgentId::random();
        let parsed = id.to_string().parse::<AgentId>().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_distinct_types() {
        let job = JobId::random();
        let serialized = serde_json::to_string(&job).expect("serialize");
        let back: JobId = serde_json::from_str(&serialized).expect("deserialize");
        assert_eq!(job, back);
    }

    #[test]
    fn invalid_uuid_rejected() {
        assert!("not-a-uuid".parse::<ConnectionId>().is_err());
    }
}
