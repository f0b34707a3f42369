pub mod backoff;
pub mod buf;
pub mod safe_converter;
