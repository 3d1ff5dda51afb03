//! Host API for fabric guest modules.
//!
//! Every function here is linked under the `env` import module, once under
//! its canonical name and once with the `_swift` suffix. The final argument
//! of every function is the call identifier.
//!
//! # Interfaces
//!
//! - [`ffi`]: `return_result`, `return_error`, `return_abort`,
//!   `get_ffi_result`, `add_ffi_var`
//! - [`logging`]: `log_msg`
//! - [`http_outbound`]: `fetch_url`, `graphql_query`
//! - [`request`]: `request_get_field`, `request_set_field`, `resp_set_header`
//! - [`cache`]: `cache_set`, `cache_get`
//! - [`database`]: `db_exec`
//! - [`static_files`]: `get_static_file`
//! - [`secrets`]: `get_secret_value`
//!
//! # Security Model
//!
//! 1. **Permissions**: outbound HTTP is limited to allow-listed hosts.
//! 2. **Budget**: outbound requests are capped per call.
//! 3. **SSRF Protection**: private/internal network addresses are blocked.
//! 4. **Isolation**: cache entries are scoped to the caller's tenant; static
//!    file reads cannot leave their directory.

pub mod cache;
pub mod database;
pub mod ffi;
pub mod http_outbound;
pub mod linker;
pub mod logging;
pub mod permissions;
pub mod request;
pub mod secrets;
pub mod static_files;

pub use cache::GuestCache;
pub use database::Database;
pub use http_outbound::HttpOutboundHost;
pub use linker::{Capabilities, host_registry, register_all};
pub use permissions::Permissions;
pub use request::FieldType;
pub use secrets::Secrets;
pub use static_files::StaticFiles;
