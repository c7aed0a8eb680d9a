//! An embedded, transactional, ordered key-value store.
//!
//! A single [`Environment`](environment::Environment) owns one backing file
//! (or an anonymous memory arena) and holds every named key space
//! ([`Database`](environment::Database)) within it. Each database is a B+tree
//! ([`btree`]) over a shared page cache ([`page_manager`]); large keys and
//! values spill into the blob manager ([`blob_manager`]) instead of bloating
//! tree nodes. Mutations outside an explicit transaction are their own
//! implicit one-operation transaction; explicit transactions buffer in
//! memory and are journaled on commit (see [`txn`], [`journal`]) so a crash
//! can redo the last durable changeset and replay whatever committed after
//! it.
//!
//! ```no_run
//! use ferrokv::{Config, Environment};
//!
//! let env = Environment::create(Some("my.db"), Config::new())?;
//! let db = env.database(ferrokv::environment::DEFAULT_DATABASE)?;
//! db.insert(b"k", b"v")?;
//! assert_eq!(db.find(b"k")?, Some(b"v".to_vec()));
//! env.close()?;
//! # Ok::<(), ferrokv::Error>(())
//! ```

pub mod blob_manager;
pub mod btree;
pub mod changeset;
pub mod comparator;
pub mod compression;
pub mod config;
pub mod device;
pub mod environment;
pub mod error;
pub mod freelist;
pub mod journal;
pub mod metrics;
pub mod page;
pub mod page_manager;
pub mod txn;

pub use btree::node::NodeLayout;
pub use btree::{DuplicatePosition, FindFlags, InsertFlags};
pub use comparator::{Comparator, DbType, LexicographicComparator, U32Comparator, U64Comparator};
pub use compression::{Compressor, NoopCompressor};
pub use config::{Config, DbFlags, PosixAdvice};
pub use environment::{Database, DatabaseDescriptor, Environment, DEFAULT_DATABASE};
pub use error::{Error, Result};
pub use metrics::MetricsSnapshot;
pub use txn::Transaction;
