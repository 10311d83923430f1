/// Shops held by one engine.
pub const MAX_SHOPS: usize = 10_000;

/// Live reservations per shop.
pub const MAX_RESERVATIONS_PER_SHOP: usize = 100_000;

/// Opening windows per shop (a handful per weekday in practice).
pub const MAX_WINDOWS_PER_SHOP: usize = 168;

pub const MAX_NAME_LEN: usize = 256;
