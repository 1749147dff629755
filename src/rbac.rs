// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Role-based access.
//!
//! A caller's role maps to a set of [`Capability`] values. [`RbacFilter`]
//! turns a caller into an [`AccessScope`] once per request; every read and
//! write of that request consults the same scope.
//!
//! | role    | capabilities             | visibility                          |
//! |---------|--------------------------|-------------------------------------|
//! | admin   | view-all, mutate         | everything                          |
//! | manager | view-all, mutate         | everything                          |
//! | auditor | view-team                | agents actively mapped to own team  |

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::EngineError;
use crate::mapping::MappingResolver;
use crate::query::Visibility;
use crate::record::CrmRecord;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Auditor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ViewAll,
    ViewTeam,
    Mutate,
}

impl Role {
    #[must_use]
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Self::Admin | Self::Manager => &[Capability::ViewAll, Capability::Mutate],
            Self::Auditor => &[Capability::ViewTeam],
        }
    }

    #[must_use]
    pub fn can(self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Auditor => "auditor",
        }
    }
}

/// Identity of the caller, as supplied by the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub role: Role,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Reporting timezone override for trend buckets
    #[serde(default)]
    pub timezone: Option<chrono_tz::Tz>,
}

impl Caller {
    #[must_use]
    pub fn new(role: Role, team_id: Option<String>) -> Self {
        Self { role, team_id, user_id: None, timezone: None }
    }

    #[must_use]
    pub fn admin() -> Self {
        Self::new(Role::Admin, None)
    }

    #[must_use]
    pub fn manager() -> Self {
        Self::new(Role::Manager, None)
    }

    pub fn auditor(team_id: impl Into<String>) -> Self {
        Self::new(Role::Auditor, Some(team_id.into()))
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_timezone(mut self, tz: chrono_tz::Tz) -> Self {
        self.timezone = Some(tz);
        self
    }
}

/// What one request may see and do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessScope {
    pub role: Role,
    pub visibility: Visibility,
    pub can_mutate: bool,
}

impl AccessScope {
    #[must_use]
    pub fn unrestricted(role: Role) -> Self {
        Self { role, visibility: Visibility::All, can_mutate: role.can(Capability::Mutate) }
    }

    #[must_use]
    pub fn permits(&self, record: &CrmRecord) -> bool {
        self.visibility.allows_record(record)
    }

    /// Gate for mutating operations; checked before any state is read.
    pub fn require_mutate(&self, operation: &str) -> Result<(), EngineError> {
        if self.can_mutate {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!("{} may not {}", self.role.as_str(), operation)))
        }
    }

    /// Gate for reading one record.
    pub fn require_visible(&self, record: &CrmRecord) -> Result<(), EngineError> {
        if self.permits(record) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "record {} is outside the {} scope",
                record.call_id,
                self.role.as_str()
            )))
        }
    }
}

/// Builds access scopes from caller identity and current agent mappings.
#[derive(Clone)]
pub struct RbacFilter {
    resolver: MappingResolver,
}

impl RbacFilter {
    pub fn new(resolver: MappingResolver) -> Self {
        Self { resolver }
    }

    /// Compute the caller's scope. Auditors see the CRM agents actively
    /// mapped into their team; an auditor without a team sees nothing.
    pub async fn scope(&self, caller: &Caller) -> Result<AccessScope, StorageError> {
        if caller.role.can(Capability::ViewAll) {
            return Ok(AccessScope::unrestricted(caller.role));
        }
        let visibility = match caller.team_id.as_deref() {
            Some(team) if caller.role.can(Capability::ViewTeam) => {
                let agents: BTreeSet<String> =
                    self.resolver.active_agents_in_team(team).await?.into_iter().collect();
                Visibility::Agents(agents)
            }
            _ => Visibility::nothing(),
        };
        Ok(AccessScope {
            role: caller.role,
            visibility,
            can_mutate: caller.role.can(Capability::Mutate),
        })
    }

    /// Mutating operations need no visibility lookup.
    pub fn require_mutate(&self, caller: &Caller, operation: &str) -> Result<(), EngineError> {
        if caller.role.can(Capability::Mutate) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!("{} may not {}", caller.role.as_str(), operation)))
        }
    }
}
