// src/matching/mod.rs
pub mod geospatial;
pub mod text;
