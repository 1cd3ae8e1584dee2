//! Database query functions for the `tasks` table.

pub mod tasks;
