use anyhow::Result;

use crate::session::Session;

pub async fn run(session: &Session) -> Result<()> {
    let facade = session.connect().await?;
    println!("Cluster version: {}", facade.version());
    println!("Client:          {}", facade.generation());
    println!("Endpoints:       {}", facade.endpoints().join(", "));
    facade.close().await;
    Ok(())
}
