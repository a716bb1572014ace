//! Job record persistence.
//!
//! The repository is the only place job records are mutated. Implementations
//! must make `execute` atomic per record (see `JobRepository`).

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobRepository;
pub use postgres::PostgresJobRepository;
pub use r#trait::{
    DEFAULT_PAGE_SIZE, Executed, JobPage, JobRepository, JobStoreError, MAX_PAGE_SIZE, PageRequest,
};
