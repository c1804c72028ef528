//! Client run: CSV wagers → batch packer → agency session.

use crate::config::ClientConfig;
use crate::packer::{BatchPacker, PackError};
use crate::session::{AgencySession, SessionError};
use crate::shutdown::Shutdown;
use crate::wager::CsvWagerSource;

/// Register every wager in `config.bets` and return this agency's winners.
pub async fn run(config: &ClientConfig, shutdown: Shutdown) -> Result<Vec<u32>, SessionError> {
    let agency = config.id;
    let limits = config.limits()?;
    let source = CsvWagerSource::open(&config.bets, agency).map_err(PackError::from)?;
    let batches = BatchPacker::new(source, limits);

    let mut session = AgencySession::connect(config.server.as_str(), agency, shutdown).await?;
    match session.run(batches).await {
        Ok(winners) => {
            log::info!(
                "[agency {agency}] winners received count={} wagers={}",
                winners.len(),
                session.wagers_sent()
            );
            Ok(winners)
        }
        Err(e) => {
            log::error!(
                "[agency {agency}] run aborted batches_sent={} cause={e}",
                session.batches_sent()
            );
            Err(e)
        }
    }
}
