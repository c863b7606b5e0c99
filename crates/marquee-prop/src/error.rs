//! Property tree error types.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropError {
    #[error("property has been destroyed")]
    Zombie,

    #[error("a child named '{0}' already exists")]
    DuplicateName(String),

    #[error("property is not a child of this parent")]
    NotAChild,

    #[error("a property cannot be placed beneath itself")]
    Cycle,
}
