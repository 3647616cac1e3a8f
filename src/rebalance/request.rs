use clap::Args;
use serde::Serialize;

use crate::config::DefaultsConfig;
use crate::error::{RebalanceError, RebalanceResult};

const MSAT_PER_SAT: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Circular,
    Pull,
    Push,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Circular => "circular",
            Mode::Pull => "pull",
            Mode::Push => "push",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "circular" => Some(Mode::Circular),
            "pull" => Some(Mode::Pull),
            "push" => Some(Mode::Push),
            _ => None,
        }
    }
}

/// Which channels a request pins and how the open side is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Target {
    Circular {
        out_scid: String,
        in_scid: String,
    },
    Pull {
        in_scid: String,
        max_out_ppm: u64,
        /// Restricts the exits; the `max_out_ppm` filter is then ignored.
        out_list: Option<Vec<String>>,
        deplete_percent: u64,
        deplete_amount_msat: u64,
    },
    Push {
        out_scid: String,
        min_out_ppm: u64,
        /// Restricts the entries; the `min_out_ppm` filter is then ignored.
        in_list: Option<Vec<String>>,
        fill_percent: u64,
        fill_amount_msat: u64,
    },
}

/// One accepted rebalance command, amounts in msat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceRequest {
    pub id: String,
    pub target: Target,
    pub amount_msat: u64,
    pub split_msat: u64,
    pub max_ppm: u64,
    pub attempts: u32,
    pub max_hops: usize,
}

impl RebalanceRequest {
    pub fn mode(&self) -> Mode {
        match self.target {
            Target::Circular { .. } => Mode::Circular,
            Target::Pull { .. } => Mode::Pull,
            Target::Push { .. } => Mode::Push,
        }
    }

    /// Chunk sizes: `split_msat` each, the last one taking the remainder.
    pub fn chunks(&self) -> Vec<u64> {
        if self.split_msat == 0 {
            return Vec::new();
        }
        let mut chunks = Vec::new();
        let mut remaining = self.amount_msat;
        while remaining > 0 {
            let chunk = remaining.min(self.split_msat);
            chunks.push(chunk);
            remaining -= chunk;
        }
        chunks
    }

    fn validate(&self) -> RebalanceResult<()> {
        if self.amount_msat == 0 {
            return Err(RebalanceError::InvalidRequest(
                "amount must be positive".to_string(),
            ));
        }
        if self.split_msat == 0 {
            return Err(RebalanceError::InvalidRequest(
                "splitamount must be positive".to_string(),
            ));
        }
        if self.amount_msat < self.split_msat {
            return Err(RebalanceError::InvalidRequest(
                "amount is less than split amount".to_string(),
            ));
        }
        if self.attempts == 0 {
            return Err(RebalanceError::InvalidRequest(
                "attempts must be at least 1".to_string(),
            ));
        }
        if self.max_hops < 2 {
            return Err(RebalanceError::InvalidRequest(format!(
                "maxhops must be at least 2, got {}",
                self.max_hops
            )));
        }
        match &self.target {
            Target::Circular { out_scid, in_scid } => {
                require_scid("outscid", out_scid)?;
                require_scid("inscid", in_scid)?;
                if out_scid == in_scid {
                    return Err(RebalanceError::InvalidRequest(
                        "outscid and inscid must differ".to_string(),
                    ));
                }
            }
            Target::Pull {
                in_scid,
                deplete_percent,
                ..
            } => {
                require_scid("inscid", in_scid)?;
                require_percent("depleteuptopercent", *deplete_percent)?;
            }
            Target::Push {
                out_scid,
                fill_percent,
                ..
            } => {
                require_scid("outscid", out_scid)?;
                require_percent("filluptopercent", *fill_percent)?;
            }
        }
        Ok(())
    }
}

fn require_scid(name: &str, scid: &str) -> RebalanceResult<()> {
    if scid.trim().is_empty() {
        return Err(RebalanceError::InvalidRequest(format!("{} is required", name)));
    }
    Ok(())
}

fn require_percent(name: &str, percent: u64) -> RebalanceResult<()> {
    if percent > 100 {
        return Err(RebalanceError::InvalidRequest(format!(
            "{} must be between 0 and 100, got {}",
            name, percent
        )));
    }
    Ok(())
}

fn new_request_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Parameters shared by every rebalance command. Amounts in sat.
#[derive(Debug, Clone, Default, Args)]
pub struct ChunkParams {
    /// Total amount to move, in sat
    #[arg(long)]
    pub amount: Option<u64>,
    /// Size of each payment, in sat
    #[arg(long)]
    pub splitamount: Option<u64>,
    /// Fee ceiling per chunk, in ppm
    #[arg(long)]
    pub maxppm: Option<u64>,
    /// Payment tries per chunk
    #[arg(long)]
    pub attempts: Option<u32>,
    /// Maximum route length, own channels included
    #[arg(long)]
    pub maxhops: Option<usize>,
}

impl ChunkParams {
    fn build(&self, target: Target, defaults: &DefaultsConfig) -> RebalanceResult<RebalanceRequest> {
        let request = RebalanceRequest {
            id: new_request_id(),
            target,
            amount_msat: self.amount.unwrap_or(defaults.amount).saturating_mul(MSAT_PER_SAT),
            split_msat: self
                .splitamount
                .unwrap_or(defaults.splitamount)
                .saturating_mul(MSAT_PER_SAT),
            max_ppm: self.maxppm.unwrap_or(defaults.maxppm),
            attempts: self.attempts.unwrap_or(defaults.attempts),
            max_hops: self.maxhops.unwrap_or(defaults.maxhops),
        };
        request.validate()?;
        Ok(request)
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct CircularParams {
    /// Channel the payment leaves through
    #[arg(long)]
    pub outscid: String,
    /// Channel the payment comes back through
    #[arg(long)]
    pub inscid: String,
    #[command(flatten)]
    pub chunk: ChunkParams,
}

impl CircularParams {
    pub fn into_request(self, defaults: &DefaultsConfig) -> RebalanceResult<RebalanceRequest> {
        let target = Target::Circular {
            out_scid: self.outscid,
            in_scid: self.inscid,
        };
        self.chunk.build(target, defaults)
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct PullParams {
    /// Channel to pull liquidity into
    #[arg(long)]
    pub inscid: String,
    /// Highest outgoing fee rate an exit channel may charge, in ppm
    #[arg(long)]
    pub maxoutppm: Option<u64>,
    /// Only consider these exits (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub outlist: Option<Vec<String>>,
    #[arg(long)]
    pub depleteuptopercent: Option<u64>,
    /// Floor for an exit's local balance, in sat
    #[arg(long)]
    pub depleteuptoamount: Option<u64>,
    #[command(flatten)]
    pub chunk: ChunkParams,
}

impl PullParams {
    pub fn into_request(self, defaults: &DefaultsConfig) -> RebalanceResult<RebalanceRequest> {
        let target = Target::Pull {
            in_scid: self.inscid,
            max_out_ppm: self.maxoutppm.unwrap_or(defaults.maxoutppm),
            out_list: non_empty(self.outlist),
            deplete_percent: self.depleteuptopercent.unwrap_or(defaults.depleteuptopercent),
            deplete_amount_msat: self
                .depleteuptoamount
                .unwrap_or(defaults.depleteuptoamount)
                .saturating_mul(MSAT_PER_SAT),
        };
        self.chunk.build(target, defaults)
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct PushParams {
    /// Channel to push liquidity out of
    #[arg(long)]
    pub outscid: String,
    /// Lowest outgoing fee rate an entry channel must charge, in ppm
    #[arg(long)]
    pub minoutppm: Option<u64>,
    /// Only consider these entries (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub inlist: Option<Vec<String>>,
    #[arg(long)]
    pub filluptopercent: Option<u64>,
    /// Ceiling for an entry's local balance, in sat
    #[arg(long)]
    pub filluptoamount: Option<u64>,
    #[command(flatten)]
    pub chunk: ChunkParams,
}

impl PushParams {
    pub fn into_request(self, defaults: &DefaultsConfig) -> RebalanceResult<RebalanceRequest> {
        let target = Target::Push {
            out_scid: self.outscid,
            min_out_ppm: self.minoutppm.unwrap_or(defaults.minoutppm),
            in_list: non_empty(self.inlist),
            fill_percent: self.filluptopercent.unwrap_or(defaults.filluptopercent),
            fill_amount_msat: self
                .filluptoamount
                .unwrap_or(defaults.filluptoamount)
                .saturating_mul(MSAT_PER_SAT),
        };
        self.chunk.build(target, defaults)
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct NodeParams {
    /// Peer (id or alias) the payment leaves through
    #[arg(long)]
    pub outnode: String,
    /// Peer (id or alias) the payment comes back through
    #[arg(long)]
    pub innode: String,
    #[command(flatten)]
    pub chunk: ChunkParams,
}

impl NodeParams {
    /// Pin the channels resolved for the two peers.
    pub fn into_circular(self, out_scid: String, in_scid: String) -> CircularParams {
        CircularParams {
            outscid: out_scid,
            inscid: in_scid,
            chunk: self.chunk,
        }
    }
}

fn non_empty(list: Option<Vec<String>>) -> Option<Vec<String>> {
    list.map(|l| {
        l.into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
    })
    .filter(|l| !l.is_empty())
}
