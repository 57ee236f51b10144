//! Concrete backends and sources for the Trawl scraping core.

pub mod cleaner;
mod guard;
pub mod http;
pub mod salary;
pub mod selector;

#[cfg(feature = "browser")]
pub mod browser;

pub use cleaner::DescriptionCleaner;
pub use http::{HttpBackend, HttpSession};
pub use salary::parse_salary;
pub use selector::{SelectorSource, SourceDefinition};

#[cfg(feature = "browser")]
pub use browser::{BrowserBackend, BrowserSession};
