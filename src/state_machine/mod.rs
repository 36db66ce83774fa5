pub mod lifecycle_sm;
