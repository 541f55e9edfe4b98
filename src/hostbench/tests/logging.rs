/// Test binaries log through the same formatter as the real ones.
#[allow(dead_code)]
pub fn init_log() {
    ::logging::init_test_log();
}
