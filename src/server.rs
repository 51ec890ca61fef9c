//! HTTP endpoint polled by the emulator's input plugin, once per frame.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::{Context, Result, anyhow};

use crate::action::ControllerRecord;
use crate::channel::{ChannelError, ControlChannel};

/// Body of the 500 answer once the channel is shut down.
pub const SHUTDOWN_BODY: &str = "SHUTDOWN";

async fn poll_controls(channel: web::Data<ControlChannel>) -> HttpResponse {
    let channel = channel.into_inner();
    // Blocks until the agent pushes, so keep it off the async workers.
    match web::block(move || channel.poll()).await {
        Ok(Ok(frame)) => HttpResponse::Ok().json(ControllerRecord::from(frame)),
        Ok(Err(ChannelError::Shutdown)) => HttpResponse::InternalServerError().body(SHUTDOWN_BODY),
        Err(err) => {
            tracing::error!("poll task failed: {err}");
            HttpResponse::InternalServerError().body(SHUTDOWN_BODY)
        }
    }
}

/// Registers the controller route on an app.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(poll_controls));
}

/// The endpoint running on its own thread and actix system.
pub struct ControllerServer {
    channel: ControlChannel,
    handle: ServerHandle,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<std::io::Result<()>>>,
}

impl ControllerServer {
    pub fn start(channel: ControlChannel, addr: SocketAddr) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let data = web::Data::new(channel.clone());

        let thread = std::thread::Builder::new()
            .name("controller-server".to_string())
            .spawn(move || {
                actix_web::rt::System::new().block_on(async move {
                    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(routes))
                        .workers(1)
                        .disable_signals()
                        .bind(addr);
                    let server = match server {
                        Ok(server) => server,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return Ok(());
                        }
                    };
                    let local_addr = server.addrs().first().copied().unwrap_or(addr);
                    let running = server.run();
                    let _ = ready_tx.send(Ok((running.handle(), local_addr)));
                    running.await
                })
            })
            .context("failed to spawn controller server thread")?;

        let (handle, local_addr) = ready_rx
            .recv()
            .map_err(|_| anyhow!("controller server thread exited during startup"))?
            .with_context(|| format!("failed to bind controller endpoint on {addr}"))?;
        tracing::info!(%local_addr, "controller endpoint listening");

        Ok(Self {
            channel,
            handle,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Bound address; differs from the requested one when port 0 was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    /// Shuts the channel down, then the server, and waits for its thread.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.channel.shutdown();
        // The stop command is sent immediately; completion is observed via join.
        drop(self.handle.stop(true));
        match thread.join() {
            Ok(Ok(())) => tracing::info!("controller endpoint stopped"),
            Ok(Err(err)) => tracing::warn!("controller endpoint exited with error: {err}"),
            Err(_) => tracing::error!("controller server thread panicked"),
        }
    }
}

impl Drop for ControllerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionFrame, Button};
    use crate::channel::Delivery;
    use actix_web::http::StatusCode;
    use actix_web::test as web_test;
    use std::time::Duration;

    #[actix_web::test]
    async fn get_serves_pushed_frame() {
        let channel = ControlChannel::new(1, Duration::from_secs(5));
        let app = web_test::init_service(
            App::new()
                .app_data(web::Data::new(channel.clone()))
                .configure(routes),
        )
        .await;

        let producer = channel.clone();
        let pusher = std::thread::spawn(move || {
            producer.push(ActionFrame::new(10, -5).with_button(Button::A).with_button(Button::Start))
        });

        let resp = web_test::call_service(&app, web_test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = web_test::read_body_json(resp).await;
        assert_eq!(body["X_AXIS"], 10);
        assert_eq!(body["Y_AXIS"], -5);
        assert_eq!(body["A_BUTTON"], 1);
        assert_eq!(body["B_BUTTON"], 0);
        assert_eq!(body["START_BUTTON"], 1);
        assert_eq!(pusher.join().unwrap(), Ok(Delivery::Complete));
    }

    #[actix_web::test]
    async fn shutdown_answers_500() {
        let channel = ControlChannel::new(1, Duration::from_secs(5));
        channel.shutdown();
        let app = web_test::init_service(
            App::new()
                .app_data(web::Data::new(channel.clone()))
                .configure(routes),
        )
        .await;

        let resp = web_test::call_service(&app, web_test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = web_test::read_body(resp).await;
        assert_eq!(&body[..], SHUTDOWN_BODY.as_bytes());
    }

    #[test]
    fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let channel = ControlChannel::new(1, Duration::from_secs(1));
        assert!(ControllerServer::start(channel, addr).is_err());
    }
}
