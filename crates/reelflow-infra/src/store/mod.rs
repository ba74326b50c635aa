//! Job document storage backends.

pub mod fs_job;
