//! A DoIP to CAN gateway on a virtual bus.
//!
//! Usage: `cargo run --example gateway [config.toml]`
//!
//! Without configuration the gateway listens on 127.0.0.1:13400 and routes
//! the door ECU 0x0205 to 0x600/0x601 on the "body" bus. A demo tester then
//! reads the VIN of the door ECU, and of the missing ECU 0x0300.

use std::sync::Arc;
use std::time::Duration;
use std::{env, io};

extern crate doip_can_gateway;

use doip_can_gateway::{
    build_gateway, read_data_by_identifier, BusTransport, DoIpTester, GatewayConfig,
    GatewayServer, NegativeResponseCode, SimulatedEcu, VirtualBus,
};
use log::{error, info};
use regex::Regex;
use tokio::net::TcpListener;

const DEFAULT_CONFIG: &str = r#"
listen = "127.0.0.1:13400"

[[routes]]
logical_address = 0x0205
request_id = 0x600
response_id = 0x601
bus = "body"
"#;

const TESTER: u16 = 0x0e80;

// Keyed on the service then the identifier, as hex digits.
const DOOR_ANSWERS: [(&str, &str); 3] = [
    (r"^22f190$", "1HGBH41JXMN109186"),
    (r"^22f18c$", "DOOR-FL-0042"),
    (r"^22f1(8[0-9a-f]|9[0-9a-f])$", ""),
];

fn door_answer(service_id: u8, identifier: u16) -> Result<Vec<u8>, NegativeResponseCode> {
    let key = format!("{service_id:02x}{identifier:04x}");
    for (pattern, answer) in DOOR_ANSWERS {
        let re = Regex::new(pattern).map_err(|_| NegativeResponseCode::GeneralReject)?;
        if re.is_match(&key) {
            return Ok(answer.as_bytes().to_vec());
        }
    }
    match service_id {
        0x22 => Err(NegativeResponseCode::RequestOutOfRange),
        _ => Err(NegativeResponseCode::ServiceNotSupported),
    }
}

fn load_config() -> io::Result<GatewayConfig> {
    let loaded = match env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(path),
        None => GatewayConfig::from_toml_str(DEFAULT_CONFIG),
    };
    loaded.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

async fn run_tester(config: &GatewayConfig) -> Result<(), doip_can_gateway::GatewayError> {
    let timings = config.timings();
    let mut tester = DoIpTester::connect(config.listen, TESTER, &timings).await?;
    let reply_timeout = timings.response_timeout + Duration::from_secs(1);
    for target in [0x0205, 0x0300] {
        match read_data_by_identifier(&mut tester, target, 0xf190, reply_timeout).await {
            Ok(rsp) if rsp.is_positive() => println!(
                "0x{:04x} VIN: {}",
                target,
                String::from_utf8_lossy(&rsp.payload)
            ),
            Ok(rsp) => println!("0x{:04x} refused: {:?}", target, rsp.nrc),
            Err(e) => println!("0x{:04x} failed: {}", target, e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();
    let config = load_config()?;
    info!(
        "Gateway 0x{:04x}, {} routes",
        config.logical_address,
        config.routes.len()
    );

    let body = Arc::new(VirtualBus::new());
    let door = config
        .routes
        .iter()
        .find(|route| route.logical_address == 0x0205)
        .cloned();
    if let Some(door) = door {
        tokio::spawn(SimulatedEcu::for_route(&door, door_answer).run(body.attach()));
    }

    let transport: Arc<dyn BusTransport> = body;
    let gateway = build_gateway(&config, [("body".to_string(), transport)])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let gateway = Arc::new(gateway);
    gateway.spawn_bus_listeners();

    let listener = TcpListener::bind(config.listen).await?;
    let server = GatewayServer::new(gateway, config.max_payload_length);
    let serving = tokio::spawn(async move { server.serve(listener).await });

    if let Err(e) = run_tester(&config).await {
        error!("Demo tester: {}", e);
    }
    match serving.await {
        Ok(Err(e)) => error!("Gateway stopped: {}", e),
        Err(e) => error!("Gateway task: {}", e),
        Ok(Ok(())) => (),
    }
    Ok(())
}
