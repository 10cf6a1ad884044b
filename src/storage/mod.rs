pub mod cache_db;
