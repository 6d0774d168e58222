pub mod filesystem;

pub use filesystem::{read_file, remove_path, write_atomic, write_new, JobLayout};
