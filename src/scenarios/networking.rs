//! Networking scenarios: DNS config, hostname, port mapping and the host
//! network namespace mode.

use super::common::{create_container, exec_ok, run_container, run_sandbox_with, start_container};
use crate::constants::WEB_SERVER_IMAGE;
use crate::cri::{NamespaceMode, PortMapping, Protocol};
use crate::error::{Error, Result};
use crate::expect::{contain_substring, equal, eventually, expect};
use crate::fixture::{unique_name, ContainerBuilder};
use crate::suite::Registry;
use std::time::Duration;

const DNS_SERVER: &str = "8.8.8.8";
const DNS_SEARCH: &str = "google.com";
const DNS_OPTION: &str = "ndots:8";

const WEB_SERVER_PORT: i32 = 80;
const HOST_PORT: i32 = 12000;
const WEB_SERVER_MARKER: &str = "Welcome to nginx!";

/// Bound on a single reachability request, connect included.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn register(registry: &mut Registry) {
    registry.describe("[k8s.io] Networking", |group| {
        group.it(
            "runtime should support DNS config [Conformance]",
            |ctx| async move {
                let fixture = ctx
                    .fixtures()
                    .sandbox("dns")
                    .await
                    .with_dns_config(&[DNS_SERVER], &[DNS_SEARCH], &[DNS_OPTION])
                    .build();
                let sandbox = run_sandbox_with(&ctx, fixture).await?;
                let id = run_container(&ctx, &sandbox, "dns").await?;

                let resolv = exec_ok(&ctx, &id, &["cat", "/etc/resolv.conf"]).await?;
                expect(&resolv).to(contain_substring(format!("nameserver {DNS_SERVER}")))?;
                expect(&resolv).to(contain_substring(format!("search {DNS_SEARCH}")))?;
                expect(&resolv).to(contain_substring(format!("options {DNS_OPTION}")))
            },
        );

        group.it(
            "runtime should support set hostname [Conformance]",
            |ctx| async move {
                let hostname = unique_name("host");
                let fixture = ctx
                    .fixtures()
                    .sandbox("hostname")
                    .await
                    .with_hostname(&hostname)
                    .build();
                let sandbox = run_sandbox_with(&ctx, fixture).await?;
                let id = run_container(&ctx, &sandbox, "hostname").await?;

                let reported = exec_ok(&ctx, &id, &["hostname"]).await?;
                expect(reported.trim_end()).to(equal(hostname.as_str()))
            },
        );

        group.it(
            "runtime should support port mapping with host port [Conformance]",
            |ctx| async move {
                let mut mapping = PortMapping {
                    container_port: WEB_SERVER_PORT,
                    host_port: HOST_PORT,
                    ..Default::default()
                };
                mapping.set_protocol(Protocol::Tcp);
                let fixture = ctx
                    .fixtures()
                    .sandbox("portmapping")
                    .await
                    .with_port_mappings(vec![mapping])
                    .build();
                let sandbox = run_sandbox_with(&ctx, fixture).await?;
                let id = create_container(
                    &ctx,
                    &sandbox,
                    ContainerBuilder::new("web", WEB_SERVER_IMAGE),
                )
                .await?;
                start_container(&ctx, &id).await?;

                let client = http_client()?;
                let url = format!("http://127.0.0.1:{HOST_PORT}/");
                eventually(|| http_get(&client, &url))
                    .should(contain_substring(WEB_SERVER_MARKER))
                    .await?;
                Ok(())
            },
        );

        group.it(
            "runtime should support host network namespace [Conformance]",
            |ctx| async move {
                let fixture = ctx
                    .fixtures()
                    .sandbox("hostnet")
                    .await
                    .with_host_network()
                    .build();
                let sandbox = run_sandbox_with(&ctx, fixture).await?;
                let status = ctx.runtime().pod_sandbox_status(&sandbox.id).await?;
                let mode = status
                    .linux
                    .and_then(|linux| linux.namespaces)
                    .and_then(|namespaces| namespaces.options)
                    .map(|options| options.network())
                    .unwrap_or(NamespaceMode::Pod);
                expect(format!("{mode:?}")).to(equal(format!("{:?}", NamespaceMode::Node)))?;

                let id = run_container(&ctx, &sandbox, "hostnet").await?;
                let container_host = exec_ok(&ctx, &id, &["hostname"]).await?;
                let node_host = tokio::fs::read_to_string("/proc/sys/kernel/hostname").await?;
                expect(container_host.trim_end()).to(equal(node_host.trim_end()))
            },
        );
    });
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_REQUEST_TIMEOUT)
        .connect_timeout(HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::Internal(format!("http client: {e}")))
}

/// GET `url` and return the body. Every request is bounded by the client
/// timeout, so a peer that never closes the connection cannot stall polling.
async fn http_get(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await.map_err(|e| http_error(url, e))?;
    response.text().await.map_err(|e| http_error(url, e))
}

fn http_error(url: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout {
            operation: format!("GET {url}"),
            duration: HTTP_REQUEST_TIMEOUT,
        }
    } else {
        Error::Internal(format!("GET {url}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_http_get_returns_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = WEB_SERVER_MARKER;
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
        });

        let client = http_client().unwrap();
        let body = http_get(&client, &format!("http://{addr}/")).await.unwrap();
        assert_eq!(body, WEB_SERVER_MARKER);
    }

    #[tokio::test]
    async fn test_http_get_times_out_on_a_stalled_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            // Headers promise a body that never arrives.
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });

        let client = http_client().unwrap();
        let err = http_get(&client, &format!("http://{addr}/")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
    }
}
