use dispatch_core::{deinit, init, DispatchPoolBuilder};

#[test]
fn double_init_fail() {
    init().unwrap();
    let result = DispatchPoolBuilder::new().build_global();
    assert_eq!(
        result.unwrap_err().to_string(),
        "the global dispatch pool has already been initialized"
    );
    deinit().unwrap();
}
