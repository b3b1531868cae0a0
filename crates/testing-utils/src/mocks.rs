//! Scripted remote channel for exercising worker operations without SSH.
//!
//! Every host is reachable and accepts every user unless told otherwise.
//! Commands are matched against registered substrings; the most recently
//! registered match wins, and unmatched commands succeed with empty output.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::models::{Configuration, Worker};
use fleet_core::traits::{RemoteChannel, RemoteSession};
use fleet_core::{FleetError, FleetResult};

/// Scripted reply for a command pattern
#[derive(Debug, Clone)]
pub enum FakeResponse {
    Output(String),
    Exit(i32),
    Unreachable,
    /// Sleeps before answering with empty output
    Delay(Duration),
}

impl FakeResponse {
    pub fn output(text: impl Into<String>) -> Self {
        FakeResponse::Output(text.into())
    }
}

#[derive(Debug, Default)]
struct FakeHost {
    unreachable: bool,
    accepted_users: Option<HashSet<String>>,
    responses: Vec<(String, FakeResponse)>,
    commands: Vec<String>,
    uploads: Vec<(PathBuf, String)>,
    connects: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeRemoteChannel {
    hosts: Arc<Mutex<HashMap<IpAddr, FakeHost>>>,
}

impl FakeRemoteChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_host<R>(&self, address: IpAddr, f: impl FnOnce(&mut FakeHost) -> R) -> R {
        let mut hosts = self.hosts.lock().unwrap();
        f(hosts.entry(address).or_default())
    }

    pub fn set_reachable(&self, address: IpAddr, reachable: bool) {
        self.with_host(address, |host| host.unreachable = !reachable);
    }

    /// Restrict the users a host accepts; others fail authentication
    pub fn accept_users(&self, address: IpAddr, users: &[&str]) {
        self.with_host(address, |host| {
            host.accepted_users = Some(users.iter().map(|u| u.to_string()).collect());
        });
    }

    pub fn respond(&self, address: IpAddr, pattern: &str, response: FakeResponse) {
        self.with_host(address, |host| {
            host.responses.push((pattern.to_string(), response));
        });
    }

    pub fn commands(&self, address: IpAddr) -> Vec<String> {
        self.with_host(address, |host| host.commands.clone())
    }

    pub fn ran(&self, address: IpAddr, pattern: &str) -> bool {
        self.commands(address).iter().any(|c| c.contains(pattern))
    }

    pub fn uploads(&self, address: IpAddr) -> Vec<(PathBuf, String)> {
        self.with_host(address, |host| host.uploads.clone())
    }

    pub fn connect_count(&self, address: IpAddr) -> usize {
        self.with_host(address, |host| host.connects)
    }

    fn unreachable_error(address: IpAddr) -> FleetError {
        FleetError::ChannelUnreachable {
            address,
            message: "no route to host".to_string(),
        }
    }
}

#[async_trait]
impl RemoteChannel for FakeRemoteChannel {
    async fn connect(
        &self,
        worker: &Worker,
        configurations: &[Configuration],
    ) -> FleetResult<Box<dyn RemoteSession>> {
        let address = worker.address;
        let accepted = self.with_host(address, |host| {
            host.connects += 1;
            if host.unreachable {
                return Err(Self::unreachable_error(address));
            }
            Ok(configurations
                .iter()
                .find(|c| {
                    host.accepted_users
                        .as_ref()
                        .map(|users| users.contains(&c.ssh_user))
                        .unwrap_or(true)
                })
                .map(|c| c.ssh_user.clone()))
        })?;

        match accepted {
            Some(user) => Ok(Box::new(FakeSession {
                address,
                user,
                channel: self.clone(),
            })),
            None => Err(FleetError::AuthExhausted { address }),
        }
    }
}

pub struct FakeSession {
    address: IpAddr,
    user: String,
    channel: FakeRemoteChannel,
}

impl FakeSession {
    pub fn new(channel: FakeRemoteChannel, address: IpAddr, user: &str) -> Self {
        Self {
            address,
            user: user.to_string(),
            channel,
        }
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn address(&self) -> IpAddr {
        self.address
    }

    fn user(&self) -> &str {
        &self.user
    }

    async fn exec(&self, command: &str) -> FleetResult<String> {
        let response = self.channel.with_host(self.address, |host| {
            host.commands.push(command.to_string());
            if host.unreachable {
                return None;
            }
            Some(
                host.responses
                    .iter()
                    .rev()
                    .find(|(pattern, _)| command.contains(pattern.as_str()))
                    .map(|(_, response)| response.clone())
                    .unwrap_or_else(|| FakeResponse::Output(String::new())),
            )
        });

        match response {
            None | Some(FakeResponse::Unreachable) => {
                Err(FakeRemoteChannel::unreachable_error(self.address))
            }
            Some(FakeResponse::Output(output)) => Ok(output),
            Some(FakeResponse::Exit(code)) => Err(FleetError::NonZeroExit {
                code,
                command: command.to_string(),
            }),
            Some(FakeResponse::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(String::new())
            }
        }
    }

    async fn put_file(&self, local: &Path, remote: &str) -> FleetResult<()> {
        let reachable = self.channel.with_host(self.address, |host| {
            host.uploads.push((local.to_path_buf(), remote.to_string()));
            !host.unreachable
        });
        if reachable {
            Ok(())
        } else {
            Err(FakeRemoteChannel::unreachable_error(self.address))
        }
    }

    async fn get_file(&self, remote: &str, local: &Path) -> FleetResult<()> {
        let contents = self.exec(&format!("cat {remote}")).await?;
        tokio::fs::write(local, contents).await?;
        Ok(())
    }
}
