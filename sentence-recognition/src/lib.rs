pub mod accuracy;
pub mod augmentors;
pub mod callbacks;
pub mod config;
pub mod ctc;
pub mod dataset;
pub mod model;
pub mod package;
pub mod provider;
pub mod recognizer;
pub mod trainer;
pub mod transformers;
