pub mod assignments;
pub mod batches;
pub mod core;
pub mod courses;
pub mod folders;
pub mod imports;
pub mod materials;
pub mod submissions;
pub mod users;
