use std::net::IpAddr;

use fleet_core::models::Worker;
use fleet_core::traits::{RemoteChannel, RemoteSession, Repositories};
use fleet_core::FleetResult;

/// 读取Worker及其全部配置，并用这些凭据打开远程会话
pub async fn open_session(
    repos: &Repositories,
    channel: &dyn RemoteChannel,
    address: IpAddr,
) -> FleetResult<(Worker, Box<dyn RemoteSession>)> {
    let worker = repos.workers.get_required(address).await?;
    let configurations = repos.configurations.for_worker(&worker).await?;
    let session = channel.connect(&worker, &configurations).await?;
    Ok((worker, session))
}
