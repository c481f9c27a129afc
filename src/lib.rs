mod lock;

pub mod form;
pub mod prelude;
pub mod reactive;
