mod collection;
mod dependency;
mod file;
mod site;
mod status;
mod version;

pub use collection::FilesCollection;
pub use dependency::Dependency;
pub use file::FileRecord;
pub use site::{format_url, UpdateSite};
pub use status::{Action, Status};
pub use version::Version;
