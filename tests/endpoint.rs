use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use n64_rl_bridge::adapter::mario_kart::MarioKartConfig;
use n64_rl_bridge::server::SHUTDOWN_BODY;
use n64_rl_bridge::{
    ActionFrame, Button, ControlChannel, ControllerRecord, ControllerServer, Delivery, EnvConfig,
    KartAction, MarioKartAdapter, Mupen64Env, PixelGrid, ReplaySource, Rgb,
};

/// One plugin poll over plain HTTP. `None` once the server is unreachable.
fn http_get(addr: SocketAddr) -> Option<(u16, String)> {
    let mut stream = TcpStream::connect(addr).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(10))).ok()?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .ok()?;
    let mut raw = String::new();
    stream.read_to_string(&mut raw).ok()?;
    let status = raw.split_whitespace().nth(1)?.parse().ok()?;
    let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string())?;
    Some((status, body))
}

/// Polls like the input plugin until the endpoint says SHUTDOWN.
fn plugin(addr: SocketAddr) -> JoinHandle<Vec<ControllerRecord>> {
    thread::spawn(move || {
        let mut records = Vec::new();
        while let Some((status, body)) = http_get(addr) {
            if status != 200 {
                assert_eq!(status, 500);
                assert_eq!(body, SHUTDOWN_BODY);
                break;
            }
            records.push(serde_json::from_str(&body).unwrap());
        }
        records
    })
}

fn start(frame_skip: u32) -> (ControlChannel, ControllerServer) {
    let channel = ControlChannel::new(frame_skip, Duration::from_secs(10));
    let server = ControllerServer::start(channel.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
    (channel, server)
}

#[test]
fn plugin_sees_each_frame_frame_skip_times() {
    let (channel, mut server) = start(2);
    let poller = plugin(server.local_addr());

    let jump = ActionFrame::new(0, 80).with_button(Button::A);
    let left = ActionFrame::new(-60, 0);
    assert_eq!(channel.push(jump), Ok(Delivery::Complete));
    assert_eq!(channel.push(left), Ok(Delivery::Complete));

    channel.shutdown();
    let records = poller.join().unwrap();
    let frames: Vec<ActionFrame> = records
        .into_iter()
        .map(|r| ActionFrame::try_from(r).unwrap())
        .collect();
    assert_eq!(frames, [jump, jump, left, left]);
    assert_eq!(channel.stats().deliveries, 4);
    server.stop();
}

#[test]
fn episode_runs_over_http() {
    let (channel, mut server) = start(1);
    let poller = plugin(server.local_addr());

    let config = EnvConfig {
        frame_skip: 3,
        ..EnvConfig::default()
    };
    let screen = PixelGrid::filled(config.screen_width, config.screen_height, Rgb::new(90, 90, 90));
    let source = ReplaySource::from_grids(vec![screen]).unwrap();
    let adapter = MarioKartAdapter::new(MarioKartConfig::default()).unwrap();
    let mut env = Mupen64Env::new(channel, source, adapter, config);

    let straight = KartAction::Straight.controls();
    for _ in 0..2 {
        let result = env.step(&straight).unwrap();
        assert!(!result.done);
        assert!((result.reward + 0.1).abs() < 1e-12);
    }
    assert_eq!(env.step_count(), 2);

    env.close();
    let records = poller.join().unwrap();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.a_button == 1 && r.x_axis == 0));
    server.stop();
}
