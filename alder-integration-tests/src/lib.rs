//! Cross-crate scenarios live in the `tests/` directory; this crate has
//! no library code of its own.
