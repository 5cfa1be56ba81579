mod checksum;
mod token;

pub use checksum::{sha256_file_hex, sha256_hex, sha256_reader_hex, verify_sha256_file};
pub use token::{generate_pipe_name, generate_session_token};
