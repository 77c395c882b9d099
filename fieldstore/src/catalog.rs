pub mod column;
pub mod index;
pub mod model;
pub mod record;
pub mod registry;
pub mod schema;
pub mod ty;
