// sync/conflict.rs - Pluggable resolution of concurrent edits

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db::store::Fields;
use crate::{Error, Result};

/// Everything a resolver gets to see about a detected conflict
///
/// `local_updated_at` / `server_updated_at` are milliseconds since
/// epoch on the respective clocks.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub table_name: String,
    pub record_id: String,
    pub local_data: Fields,
    pub server_data: Fields,
    pub local_updated_at: i64,
    pub server_updated_at: i64,
}

/// Verdict returned by a resolver
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local version; the pending push will reach the server
    KeepLocal,
    /// Take the server version
    KeepServer,
    /// Overwrite local with a caller-built merge (server metadata applies)
    Merged(Fields),
}

/// Caller-supplied resolution function for the `Custom` strategy
pub type CustomResolver = Arc<dyn Fn(&ConflictContext) -> Resolution + Send + Sync>;

/// Built-in resolution strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    LastWriteWins,
    ServerWins,
    ClientWins,
    Custom,
}

/// Resolver selected at configuration time
#[derive(Clone)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    custom: Option<CustomResolver>,
}

impl ConflictResolver {
    /// Build a resolver; fails if `Custom` is selected without a function
    pub fn new(strategy: ConflictStrategy, custom: Option<CustomResolver>) -> Result<Self> {
        if strategy == ConflictStrategy::Custom && custom.is_none() {
            return Err(Error::Config(
                "custom conflict strategy requires a resolver function".to_string(),
            ));
        }
        Ok(Self { strategy, custom })
    }

    /// Decide the winner for one conflict
    pub fn resolve(&self, context: &ConflictContext) -> Resolution {
        match self.strategy {
            ConflictStrategy::LastWriteWins => {
                if context.local_updated_at > context.server_updated_at {
                    Resolution::KeepLocal
                } else {
                    Resolution::KeepServer
                }
            }
            ConflictStrategy::ServerWins => Resolution::KeepServer,
            ConflictStrategy::ClientWins => Resolution::KeepLocal,
            ConflictStrategy::Custom => {
                // presence enforced by the constructor
                match &self.custom {
                    Some(resolver) => resolver(context),
                    None => Resolution::KeepServer,
                }
            }
        }
    }
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("strategy", &self.strategy)
            .finish()
    }
}
