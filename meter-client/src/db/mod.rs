pub mod access_queries;
pub mod schema;
pub mod watermark_queries;
