// Client and connection metadata cache
//
// Populated lazily from chain queries the first time a wallet needs a
// route's client. `chain_id` is always the chain hosting the client or
// connection; `counterparty_chain_id` is the chain it tracks.

use super::RelayStore;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ClientRecord {
    pub chain_id: String,
    pub client_id: String,
    pub counterparty_chain_id: String,
    pub trusting_period_secs: i64,
    pub revision_number: i64,
    /// Latest counterparty height the client is known to trust
    pub revision_height: i64,
    /// Unix seconds of the last update this relayer observed or submitted
    pub last_update_time: i64,
}

impl ClientRecord {
    /// A client is refreshed once two thirds of its trusting period have elapsed
    pub fn needs_refresh(&self, now_secs: i64) -> bool {
        let threshold = self.trusting_period_secs * 2 / 3;
        now_secs - self.last_update_time >= threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ConnectionRecord {
    pub chain_id: String,
    pub connection_id: String,
    pub client_id: String,
    pub counterparty_chain_id: String,
    pub counterparty_client_id: String,
    pub counterparty_connection_id: String,
}

impl RelayStore {
    pub async fn get_connection(
        &self,
        chain_id: &str,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>> {
        Ok(sqlx::query_as::<_, ConnectionRecord>(
            "SELECT chain_id, connection_id, client_id, counterparty_chain_id,
                    counterparty_client_id, counterparty_connection_id
             FROM connections WHERE chain_id = ? AND connection_id = ?",
        )
        .bind(chain_id)
        .bind(connection_id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn upsert_connection(&self, record: &ConnectionRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO connections (chain_id, connection_id, client_id,
                 counterparty_chain_id, counterparty_client_id, counterparty_connection_id)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.chain_id)
        .bind(&record.connection_id)
        .bind(&record.client_id)
        .bind(&record.counterparty_chain_id)
        .bind(&record.counterparty_client_id)
        .bind(&record.counterparty_connection_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_client(&self, chain_id: &str, client_id: &str) -> Result<Option<ClientRecord>> {
        Ok(sqlx::query_as::<_, ClientRecord>(
            "SELECT chain_id, client_id, counterparty_chain_id, trusting_period_secs,
                    revision_number, revision_height, last_update_time
             FROM clients WHERE chain_id = ? AND client_id = ?",
        )
        .bind(chain_id)
        .bind(client_id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn upsert_client(&self, record: &ClientRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO clients (chain_id, client_id, counterparty_chain_id,
                 trusting_period_secs, revision_number, revision_height, last_update_time)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.chain_id)
        .bind(&record.client_id)
        .bind(&record.counterparty_chain_id)
        .bind(record.trusting_period_secs)
        .bind(record.revision_number)
        .bind(record.revision_height)
        .bind(record.last_update_time)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a successful update; the trusted height never moves backwards
    pub async fn update_client_height(
        &self,
        chain_id: &str,
        client_id: &str,
        revision_height: u64,
        update_time: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE clients
             SET revision_height = MAX(revision_height, ?), last_update_time = ?
             WHERE chain_id = ? AND client_id = ?",
        )
        .bind(revision_height as i64)
        .bind(update_time)
        .bind(chain_id)
        .bind(client_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Forget a client so its trusted height is re-read from chain
    pub async fn evict_client(&self, chain_id: &str, client_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM clients WHERE chain_id = ? AND client_id = ?")
            .bind(chain_id)
            .bind(client_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn clients_on(&self, chain_id: &str) -> Result<Vec<ClientRecord>> {
        Ok(sqlx::query_as::<_, ClientRecord>(
            "SELECT chain_id, client_id, counterparty_chain_id, trusting_period_secs,
                    revision_number, revision_height, last_update_time
             FROM clients WHERE chain_id = ? ORDER BY client_id",
        )
        .bind(chain_id)
        .fetch_all(self.pool())
        .await?)
    }
}
