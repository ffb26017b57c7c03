pub mod helpers;
mod tests_repair;
