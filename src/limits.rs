/// Registered vehicles per engine.
pub const MAX_VEHICLES: usize = 100_000;

/// Registered user profiles per engine.
pub const MAX_USERS: usize = 100_000;

/// Free-text columns (company, brand, model, names, city).
pub const MAX_FIELD_LEN: usize = 255;

/// License plates after normalization, e.g. `RFWB-77`.
pub const MAX_PLATE_LEN: usize = 10;

/// Company tax id, e.g. `80.010.900-0`.
pub const MAX_RUT_LEN: usize = 20;

/// Rows in one reservations INSERT. A request can never need more than one day's slots.
pub const MAX_BATCH_SIZE: usize = crate::calendar::SLOTS_PER_DAY;

/// Rows in one reservations import.
pub const MAX_IMPORT_SIZE: usize = 10_000;
