//! In-memory record queries.
//!
//! A [`RecordsQuery`] filters records by [`Source`] schema and by a tree of
//! [`Constraint`]s, then sorts and limits them. Stores may translate the
//! constraint tree through a [`ConstraintVisitor`] instead of scanning every
//! record.

mod constraint;
pub use constraint::*;

mod records;
pub use records::*;

mod single;
pub use single::*;

mod visitor;
pub use visitor::*;
