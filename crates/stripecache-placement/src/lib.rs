//! StripeCache Placement - Stripe routing
//!
//! Maps content keys onto stripes with a CARP-style weighted table: each
//! stripe receives a share of the table proportional to its length, and
//! the assignment stays stable when stripes are added or removed.
//!
//! # Example
//! ```ignore
//! use stripecache_placement::{RouteTarget, StripeHashTable};
//!
//! let table = StripeHashTable::build(&targets)?;
//! let stripe = table.key_to_stripe(&key);
//! ```

pub mod hash_table;

pub use hash_table::{EMPTY_SLOT, ROUTING_TABLE_SIZE, RouteTarget, StripeHashTable, TICKET_BLOCKS};
