//! Narrow ZooKeeper interface: the one operation restore needs is removing
//! a replica's metadata subtree before the table is re-created.

use zookeeper_client as zk;

use crate::{
	config::ZookeeperConfig,
	error::{Error, Result},
};

pub struct ZookeeperClient {
	client: zk::Client,
}

impl std::fmt::Debug for ZookeeperClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ZookeeperClient").finish_non_exhaustive()
	}
}

fn zk_error(what: &str, err: impl std::fmt::Display) -> Error {
	Error::storage(format!("zookeeper: {what}: {err}"))
}

impl ZookeeperClient {
	pub async fn connect(config: &ZookeeperConfig) -> Result<Self> {
		let connect_string = config.connect_string();
		let client = tokio::time::timeout(config.timeout, zk::Client::connect(&connect_string))
			.await
			.map_err(|_| zk_error("connecting", "timed out"))?
			.map_err(|err| zk_error("connecting", err))?;
		Ok(Self { client })
	}

	/// Delete a node and everything below it. Missing nodes are fine: the
	/// point is that the subtree is gone afterwards.
	pub async fn delete_recursive(&self, root: &str) -> Result<()> {
		let mut stack = vec![root.to_string()];
		let mut subtree = Vec::new();

		while let Some(path) = stack.pop() {
			match self.client.list_children(&path).await {
				Ok(children) => {
					for child in children {
						stack.push(format!("{path}/{child}"));
					}
					subtree.push(path);
				}
				Err(zk::Error::NoNode) => {}
				Err(err) => return Err(zk_error("listing children", err)),
			}
		}

		// Children were discovered after their parents, so deleting in
		// reverse order empties each node before it is removed.
		for path in subtree.iter().rev() {
			match self.client.delete(path, None).await {
				Ok(()) | Err(zk::Error::NoNode) => {}
				Err(err) => return Err(zk_error(format!("deleting {path}").as_str(), err)),
			}
		}
		Ok(())
	}
}
