use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

macro_rules! entity_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mints a fresh random identifier. Assigned once, never regenerated.
            pub fn fresh() -> Self {
                Self(Uuid::new_v4())
            }
            /// The raw uuid, the only valid cross-worker address for this entity.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(EnvId, "Identity of one Environment (shot/asset-variant target).");
entity_id!(PassId, "Identity of one RenderPass.");
entity_id!(SourceId, "Identity of one shared RenderSource (the render node column).");

macro_rules! sched_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Wraps an identifier handed back by the scheduler.
            pub fn from_str(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            /// Borrows the raw identifier text.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

sched_id!(JobId, "Opaque scheduler job identifier.");
sched_id!(LayerId, "Opaque scheduler layer identifier.");
sched_id!(TaskId, "Opaque scheduler task identifier.");

/// Scopes one submission's shared-store traffic. All workers dispatched from
/// the same submission share one bucket.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketId(pub String);

impl BucketId {
    /// Mints a new submission-wide bucket id (`sub-<ulid>`).
    pub fn mint() -> Self {
        Self(format!("sub-{}", Ulid::new().to_string().to_lowercase()))
    }
    /// Wraps an existing bucket id (workers receive theirs on the command line).
    pub fn from_str(s: impl Into<String>) -> Self {
        Self(s.into())
    }
    /// Borrows the raw bucket text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Either kind of resolvable item, as it appears in reports and wait-on tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemId {
    /// An Environment.
    Environment(EnvId),
    /// A RenderPass.
    Pass(PassId),
}

impl ItemId {
    /// The underlying uuid regardless of kind.
    pub fn uuid(&self) -> Uuid {
        match self {
            ItemId::Environment(id) => id.0,
            ItemId::Pass(id) => id.0,
        }
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.uuid().fmt(f)
    }
}
