//! Reference delegation adapters.

pub mod http;
pub mod kerberos;
pub mod sql;
