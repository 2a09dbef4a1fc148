//! Background housekeeping of the page cache.
//!
//! [`ReclaimCollector`] picks the least useful idle pages during a maintenance
//! scan; the [`Housekeeper`] thread decides when to run scans.

mod collector;
mod housekeeper;

pub(crate) use collector::ReclaimCollector;
pub(crate) use housekeeper::Housekeeper;
