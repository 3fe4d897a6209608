pub mod server;

pub fn vtyserve_bin() -> std::path::PathBuf {
    let mut path = std::env::current_exe().expect("current test exe");
    path.pop(); // deps/
    path.pop(); // target/debug or target/release
    path.push("vtyserve");
    path
}

/// Picks a high, likely-free TCP port. Not perfectly race-free, but
/// good enough for a test suite that runs a handful of servers
/// sequentially.
pub fn pick_port() -> u16 {
    use rand::Rng;
    rand::thread_rng().gen_range(20000..40000)
}
