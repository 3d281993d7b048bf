pub mod definition;
pub mod expr;
pub mod runtime;
pub mod tasks;
pub mod vars;
