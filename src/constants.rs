/// Default page size for the encounter history endpoint.
pub const DEFAULT_ENCOUNTER_PAGE_SIZE: usize = 20;

/// Upper bound for `?limit=` on the encounter history endpoint.
pub const MAX_ENCOUNTER_PAGE_SIZE: usize = 100;

/// Maximum request body size: 64 KiB. Engagement payloads are tiny.
pub const MAX_BODY_SIZE: usize = 64 * 1024;
