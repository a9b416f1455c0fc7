mod clean;
mod index;
mod models;
mod search;
pub mod server;
mod status;

pub use clean::*;
pub use index::*;
pub use models::*;
pub use search::*;
pub use server::*;
pub use status::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
