/// hydstra_sync: incremental extraction of hydrological time series from
/// Hydstra into flat files or a relational table.
///
/// # Module structure
///
/// ```text
/// hydstra_sync
/// ├── model      — shared data types (Period, Trace, Batch, HydstraError, …)
/// ├── variables  — variable code registry: aggregation, relabel, site form
/// ├── config     — TOML configuration with .env overrides
/// ├── logging    — channel-tagged console/file logger
/// ├── rpc
/// │   ├── protocol   — JSON call variants, envelope, decoders, time encoding
/// │   ├── hydllp     — Transport seam + protocol client (buffer resize)
/// │   └── webservice — Transport over the Hydstra HTTP web service
/// ├── sql
/// │   ├── hydstra — PERIOD / RATEHED / RATEPER queries
/// │   ├── pg      — PostgreSQL store and export writer
/// │   └── memory  — in-memory tables
/// ├── resolve    — per-site variable periods
/// ├── changes    — modification detection and period narrowing
/// ├── extract    — chunked trace extraction with quality filtering
/// ├── transform  — relabel, scale and remap into output records
/// ├── export
/// │   ├── file  — append-only columnar store
/// │   └── table — delete-then-insert relational sink
/// ├── archive    — archive file modification times
/// └── client     — HydstraClient: simple and bulk extraction paths
/// ```

pub mod archive;
pub mod changes;
pub mod client;
pub mod config;
pub mod export;
pub mod extract;
pub mod logging;
pub mod model;
pub mod resolve;
pub mod rpc;
pub mod sql;
pub mod transform;
pub mod variables;
