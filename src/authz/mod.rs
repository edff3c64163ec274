//! Tenants, roles and resources.
//!
//! Resources are leaf permission strings. Roles are sets of resources scoped
//! either globally (`*/name`) or to one tenant (`tenant/name`). Credentials
//! are assigned to tenants and to roles; [`RbacService::compute_authorization`]
//! folds those assignments into the per-tenant grant map carried by sessions.

use std::collections::{BTreeMap, BTreeSet};

mod rbac;
mod resource;
mod role;
mod tenant;

pub use rbac::{has_resource_access, is_superuser, RbacService};
pub use resource::{
    builtin_resources, is_global_only, resource_id, validate_resource_id, Resource,
    ResourceService, GLOBAL_ONLY_RESOURCES,
};
pub use role::{Role, RoleId, RoleService};
pub use tenant::{Tenant, TenantService, TenantUpdate};

/// Scope key for grants that apply regardless of tenant.
pub const GLOBAL_SCOPE: &str = "*";

/// Effective grants keyed by tenant; `*` holds the global set.
pub type Authz = BTreeMap<String, BTreeSet<String>>;
