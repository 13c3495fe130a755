//! CLI commands implementation

pub mod crm;
pub mod init;
pub mod requests;
pub mod serve;
pub mod tenants;

pub use crm::*;
pub use init::*;
pub use requests::*;
pub use serve::*;
pub use tenants::*;
