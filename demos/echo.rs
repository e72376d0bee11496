use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rdmarpc::prelude::*;

const ECHO: u32 = 1;
const UPPER: u32 = 2;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // An optional TOML file configures both ends.
    let config = match std::env::args().nth(1) {
        Some(path) => RpcConfig::load_toml(path)?,
        None => RpcConfig::default(),
    };

    let server = Arc::new(Server::with_config("127.0.0.1", "0", config.server));
    server.register_handler(ECHO, |req, resp| {
        resp.write_all(req)?;
        Ok(())
    });
    server.register_handler(UPPER, |req, resp| {
        let text = std::str::from_utf8(req)?;
        resp.write_all(text.to_uppercase().as_bytes())?;
        Ok(())
    });

    let runner = thread::spawn({
        let server = server.clone();
        move || server.run()
    });
    let addr = server
        .wait_listening(Duration::from_secs(1))
        .ok_or_else(|| anyhow::anyhow!("server did not start"))?;
    println!("server listening on {}", addr);

    let client = Client::with_config(config.client);
    let conn = client.connect("127.0.0.1", &addr.port().to_string())?;

    let resp = client.call(conn, ECHO, b"Hello, rdmarpc!")?;
    println!("echo: {}", String::from_utf8_lossy(&resp));
    let resp = client.call(conn, UPPER, b"Hello, rdmarpc!")?;
    println!("upper: {}", String::from_utf8_lossy(&resp));
    match client.call(conn, 42, b"") {
        Err(e) => println!("procedure 42: {}", e),
        Ok(_) => println!("procedure 42 unexpectedly answered"),
    }

    client.disconnect(conn)?;
    server.shutdown_handle().shutdown();
    runner
        .join()
        .map_err(|_| anyhow::anyhow!("server thread panicked"))??;
    Ok(())
}
