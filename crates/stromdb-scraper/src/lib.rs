pub mod client;
pub mod error;
pub mod extract;
pub mod rate_limit;

pub use client::{source_url, FetchedPage, Fetcher, HttpFetcher};
pub use error::{FetchError, PageError, ScraperError};
pub use extract::{
    check_page, classify_city, correct_price_logic, extract, page_text, CityClass,
    ExtractionResult, PageFormat,
};
pub use rate_limit::{pause, retry_with_delay, Attempted};
