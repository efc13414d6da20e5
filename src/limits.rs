//! Hard limits enforced at the engine and tenant boundaries.

pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_NAME_LEN: usize = 255;

/// One interval per five minutes of a day.
pub const MAX_INTERVALS_PER_DAY: usize = 288;

pub const MAX_USERS_PER_TENANT: usize = 1_000_000;
pub const MAX_PROFESSIONALS_PER_TENANT: usize = 100_000;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 63;
