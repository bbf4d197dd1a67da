// Packet fee records from incentivized packet events
use sqlx::SqliteConnection;
use std::fmt;

use super::RelayStore;
use crate::error::Result;
use crate::events::{Coin, IncentivizedPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeeType {
    Recv,
    Ack,
    Timeout,
}

impl FeeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeType::Recv => "RECV",
            FeeType::Ack => "ACK",
            FeeType::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for FeeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One coin of one fee type escrowed for a packet
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FeeRecord {
    pub chain_id: String,
    pub port_id: String,
    pub channel_id: String,
    pub sequence: i64,
    pub fee_type: String,
    pub denom: String,
    /// Decimal string; amounts may exceed 64 bits
    pub amount: String,
}

pub(crate) async fn apply_fee_event(
    conn: &mut SqliteConnection,
    chain_id: &str,
    fee: &IncentivizedPacket,
) -> Result<bool> {
    let groups: [(FeeType, &[Coin]); 3] = [
        (FeeType::Recv, fee.recv_fee.as_slice()),
        (FeeType::Ack, fee.ack_fee.as_slice()),
        (FeeType::Timeout, fee.timeout_fee.as_slice()),
    ];

    for (fee_type, coins) in groups {
        for coin in coins {
            sqlx::query(
                "INSERT INTO packet_fees (chain_id, port_id, channel_id, sequence, fee_type, denom, amount)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (chain_id, channel_id, sequence, fee_type, denom)
                 DO UPDATE SET amount = excluded.amount",
            )
            .bind(chain_id)
            .bind(&fee.port_id)
            .bind(&fee.channel_id)
            .bind(fee.sequence as i64)
            .bind(fee_type.as_str())
            .bind(&coin.denom)
            .bind(&coin.amount)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(true)
}

/// Fees are paid out once the packet is acknowledged or timed out on its source chain
pub(crate) async fn delete_fees(
    conn: &mut SqliteConnection,
    chain_id: &str,
    channel_id: &str,
    sequence: u64,
) -> Result<()> {
    sqlx::query("DELETE FROM packet_fees WHERE chain_id = ? AND channel_id = ? AND sequence = ?")
        .bind(chain_id)
        .bind(channel_id)
        .bind(sequence as i64)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl RelayStore {
    pub async fn fees_for(
        &self,
        chain_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> Result<Vec<FeeRecord>> {
        Ok(sqlx::query_as::<_, FeeRecord>(
            "SELECT chain_id, port_id, channel_id, sequence, fee_type, denom, amount
             FROM packet_fees WHERE chain_id = ? AND channel_id = ? AND sequence = ?
             ORDER BY fee_type, denom",
        )
        .bind(chain_id)
        .bind(channel_id)
        .bind(sequence as i64)
        .fetch_all(self.pool())
        .await?)
    }
}
