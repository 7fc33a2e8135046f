pub mod store;
pub mod downloader;

pub use store::{DownloadRecord, DownloadStore};
pub use downloader::{DownloadItem, DownloadLimit, ResumableDownloader};
