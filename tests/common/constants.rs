pub const TEST_VERSION: &str = "test-v1";
pub const NEXT_VERSION: &str = "test-v2";
pub const FILE_NOT_FOUND: &str = "File not found";
