//! Typed client for the election contract.
//!
//! Every method encodes one contract call, awaits the wallet, and returns a
//! domain value or a `RemoteCallError` with the provider's raw message.
//! Nothing here touches session state.

use crate::error::RemoteCallError;
use crate::gateway::RequestClient;
use ethers::abi::{Event, EventParam, Function, Param, ParamType, RawLog, StateMutability, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Log, TransactionRequest, TxHash, I256, U256};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// One of the two candidates the contract tracks seats for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Candidate {
    A = 1,
    B = 2,
}

impl Candidate {
    pub const ALL: [Candidate; 2] = [Candidate::A, Candidate::B];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u64) -> Option<Self> {
        match id {
            1 => Some(Candidate::A),
            2 => Some(Candidate::B),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Candidate::A => "Trump",
            Candidate::B => "Biden",
        }
    }
}

/// Seat totals for both candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeatCounts {
    pub a: u64,
    pub b: u64,
}

impl SeatCounts {
    pub fn get(&self, candidate: Candidate) -> u64 {
        match candidate {
            Candidate::A => self.a,
            Candidate::B => self.b,
        }
    }
}

/// Validated per-state result ready for `submitStateResult`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateResult {
    pub region: String,
    pub votes_a: u64,
    pub votes_b: u64,
    pub seats: u8,
}

/// A write the wallet accepted and broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub tx_hash: TxHash,
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// 1 = success, 0 = reverted
    pub status: u64,
    pub tx_hash: TxHash,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.status == 1
    }
}

struct ElectionAbi {
    seats: Function,
    current_leader: Function,
    election_ended: Function,
    submit_state_result: Function,
    end_election: Function,
    resume_election: Function,
    log_state_result: Event,
}

fn params(kinds: Vec<ParamType>) -> Vec<Param> {
    kinds
        .into_iter()
        .map(|kind| Param {
            name: String::new(),
            kind,
            internal_type: None,
        })
        .collect()
}

#[allow(deprecated)]
fn function(name: &str, inputs: Vec<ParamType>, outputs: Vec<ParamType>, state_mutability: StateMutability) -> Function {
    Function {
        name: name.to_string(),
        inputs: params(inputs),
        outputs: params(outputs),
        constant: None,
        state_mutability,
    }
}

fn abi() -> &'static ElectionAbi {
    static ABI: OnceLock<ElectionAbi> = OnceLock::new();
    ABI.get_or_init(|| ElectionAbi {
        // Outputs are declared 256 bits wide so range checks happen here
        // rather than inside the decoder.
        seats: function("seats", vec![ParamType::Uint(8)], vec![ParamType::Uint(256)], StateMutability::View),
        current_leader: function("currentLeader", vec![], vec![ParamType::Int(256)], StateMutability::View),
        election_ended: function("electionEnded", vec![], vec![ParamType::Bool], StateMutability::View),
        submit_state_result: function(
            "submitStateResult",
            vec![ParamType::Tuple(vec![
                ParamType::String,
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(8),
            ])],
            vec![],
            StateMutability::NonPayable,
        ),
        end_election: function("endElection", vec![], vec![], StateMutability::NonPayable),
        resume_election: function("resumeElection", vec![], vec![], StateMutability::NonPayable),
        log_state_result: Event {
            name: "LogStateResult".to_string(),
            inputs: vec![
                EventParam { name: "winner".to_string(), kind: ParamType::Uint(8), indexed: false },
                EventParam { name: "stateSeats".to_string(), kind: ParamType::Uint(8), indexed: false },
                EventParam { name: "state".to_string(), kind: ParamType::String, indexed: false },
            ],
            anonymous: false,
        },
    })
}

fn encode(func: &'static Function, tokens: &[Token]) -> Result<Bytes, RemoteCallError> {
    func.encode_input(tokens)
        .map(Bytes::from)
        .map_err(|e| RemoteCallError::new(func.name.as_str(), format!("failed to encode call: {}", e)))
}

pub(crate) fn seats_calldata(candidate: Candidate) -> Result<Bytes, RemoteCallError> {
    encode(&abi().seats, &[Token::Uint(U256::from(candidate.id()))])
}

pub(crate) fn current_leader_calldata() -> Result<Bytes, RemoteCallError> {
    encode(&abi().current_leader, &[])
}

pub(crate) fn election_ended_calldata() -> Result<Bytes, RemoteCallError> {
    encode(&abi().election_ended, &[])
}

pub(crate) fn submit_state_result_calldata(result: &StateResult) -> Result<Bytes, RemoteCallError> {
    let tuple = Token::Tuple(vec![
        Token::String(result.region.clone()),
        Token::Uint(U256::from(result.votes_a)),
        Token::Uint(U256::from(result.votes_b)),
        Token::Uint(U256::from(result.seats)),
    ]);
    encode(&abi().submit_state_result, &[tuple])
}

pub(crate) fn end_election_calldata() -> Result<Bytes, RemoteCallError> {
    encode(&abi().end_election, &[])
}

pub(crate) fn resume_election_calldata() -> Result<Bytes, RemoteCallError> {
    encode(&abi().resume_election, &[])
}

fn decode_single(func: &'static Function, data: &Bytes) -> Result<Token, RemoteCallError> {
    let method = func.name.as_str();
    func.decode_output(data)
        .map_err(|e| RemoteCallError::new(method, format!("undecodable return data: {}", e)))?
        .into_iter()
        .next()
        .ok_or_else(|| RemoteCallError::new(method, "empty return data"))
}

fn decode_seats(data: &Bytes) -> Result<u64, RemoteCallError> {
    match decode_single(&abi().seats, data)? {
        Token::Uint(value) if value <= U256::from(u64::MAX) => Ok(value.as_u64()),
        other => Err(RemoteCallError::new("seats", format!("unexpected seat value {:?}", other))),
    }
}

/// `currentLeader` signals failure with a negative value.
fn decode_leader(data: &Bytes) -> Result<Candidate, RemoteCallError> {
    let raw = match decode_single(&abi().current_leader, data)? {
        Token::Int(value) => I256::from_raw(value),
        other => return Err(RemoteCallError::new("currentLeader", format!("unexpected value {:?}", other))),
    };
    if raw.is_negative() {
        return Err(RemoteCallError::new("currentLeader", "Unsuccessful transaction!"));
    }
    Candidate::ALL
        .into_iter()
        .find(|c| raw == I256::from(c.id() as i64))
        .ok_or_else(|| RemoteCallError::new("currentLeader", format!("unknown candidate id {}", raw)))
}

fn decode_bool(data: &Bytes) -> Result<bool, RemoteCallError> {
    match decode_single(&abi().election_ended, data)? {
        Token::Bool(value) => Ok(value),
        other => Err(RemoteCallError::new("electionEnded", format!("unexpected value {:?}", other))),
    }
}

/// Render a contract log as informational text. `LogStateResult` is decoded,
/// anything else is shown as raw data.
pub fn describe_log(log: &Log) -> String {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let parsed = match abi().log_state_result.parse_log(raw) {
        Ok(parsed) => parsed,
        Err(_) => return format!("[event] {:?}: 0x{}", log.address, hex::encode(&log.data)),
    };

    let mut winner = String::from("?");
    let mut seats = String::from("?");
    let mut state = String::from("?");
    for param in parsed.params {
        match (param.name.as_str(), param.value) {
            ("winner", Token::Uint(id)) => {
                winner = Candidate::from_id(id.low_u64())
                    .map(|c| c.label().to_string())
                    .unwrap_or_else(|| id.to_string());
            }
            ("stateSeats", Token::Uint(value)) => seats = value.to_string(),
            ("state", Token::String(value)) => state = value,
            _ => {}
        }
    }
    format!("[event: LogStateResult] {} won {} seat(s) in {}", winner, seats, state)
}

/// Client for one deployed election contract.
#[derive(Clone)]
pub struct ElectionContract {
    address: Address,
    from: Address,
    client: RequestClient,
}

impl ElectionContract {
    pub fn new(address: Address, from: Address, client: RequestClient) -> Self {
        Self { address, from, client }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sender(&self) -> Address {
        self.from
    }

    /// Same contract, transactions sent from another account.
    pub fn with_sender(&self, from: Address) -> Self {
        Self {
            from,
            ..self.clone()
        }
    }

    fn request(&self, data: Bytes) -> TypedTransaction {
        TransactionRequest::new()
            .to(self.address)
            .from(self.from)
            .data(data)
            .into()
    }

    async fn read(&self, method: &'static str, data: Bytes) -> Result<Bytes, RemoteCallError> {
        debug!("Calling {} on {:?}", method, self.address);
        self.client
            .call(&self.request(data))
            .await
            .map_err(|e| RemoteCallError::from_provider(method, e))
    }

    async fn write(&self, method: &'static str, data: Bytes) -> Result<PendingWrite, RemoteCallError> {
        match self.client.send_transaction(self.request(data)).await {
            Ok(tx_hash) => Ok(PendingWrite { tx_hash }),
            Err(e) => {
                warn!("{} was not accepted: {}", method, e);
                Err(RemoteCallError::from_provider(method, e))
            }
        }
    }

    pub async fn seats(&self, candidate: Candidate) -> Result<u64, RemoteCallError> {
        let data = self.read("seats", seats_calldata(candidate)?).await?;
        decode_seats(&data)
    }

    pub async fn seat_counts(&self) -> Result<SeatCounts, RemoteCallError> {
        let a = self.seats(Candidate::A).await?;
        let b = self.seats(Candidate::B).await?;
        Ok(SeatCounts { a, b })
    }

    pub async fn current_leader(&self) -> Result<Candidate, RemoteCallError> {
        let data = self.read("currentLeader", current_leader_calldata()?).await?;
        decode_leader(&data)
    }

    pub async fn election_ended(&self) -> Result<bool, RemoteCallError> {
        let data = self.read("electionEnded", election_ended_calldata()?).await?;
        decode_bool(&data)
    }

    pub async fn submit_state_result(&self, result: &StateResult) -> Result<PendingWrite, RemoteCallError> {
        self.write("submitStateResult", submit_state_result_calldata(result)?).await
    }

    pub async fn end_election(&self) -> Result<PendingWrite, RemoteCallError> {
        self.write("endElection", end_election_calldata()?).await
    }

    pub async fn resume_election(&self) -> Result<PendingWrite, RemoteCallError> {
        self.write("resumeElection", resume_election_calldata()?).await
    }

    /// Wait until the transaction is mined. A receipt without a status field
    /// (pre-Byzantium) counts as success.
    pub async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<Receipt, RemoteCallError> {
        let receipt = self
            .client
            .wait_for_receipt(tx_hash)
            .await
            .map_err(|e| RemoteCallError::from_provider("waitForReceipt", e))?;
        Ok(Receipt {
            status: receipt.status.map(|s| s.as_u64()).unwrap_or(1),
            tx_hash: receipt.transaction_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{abi_bool, abi_int, abi_uint, MockWallet};
    use ethers::types::H256;

    fn contract_for(wallet: &std::sync::Arc<MockWallet>) -> ElectionContract {
        ElectionContract::new(Address::repeat_byte(0xee), Address::repeat_byte(1), wallet.request_client())
    }

    // ==================== calldata ====================

    #[test]
    fn test_selectors_match_solidity_signatures() {
        assert_eq!(abi().seats.short_signature(), ethers::utils::id("seats(uint8)"));
        assert_eq!(abi().current_leader.short_signature(), ethers::utils::id("currentLeader()"));
        assert_eq!(abi().election_ended.short_signature(), ethers::utils::id("electionEnded()"));
        assert_eq!(
            abi().submit_state_result.short_signature(),
            ethers::utils::id("submitStateResult((string,uint256,uint256,uint8))")
        );
        assert_eq!(abi().end_election.short_signature(), ethers::utils::id("endElection()"));
        assert_eq!(abi().resume_election.short_signature(), ethers::utils::id("resumeElection()"));
    }

    #[test]
    fn test_seats_calldata_encodes_candidate_id() {
        let data = seats_calldata(Candidate::B).unwrap();
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(data[35], 2);
    }

    #[test]
    fn test_encode_error_names_the_method() {
        let err = encode(&abi().seats, &[]).unwrap_err();
        assert_eq!(err.method, "seats");
    }

    // ==================== decoding ====================

    #[test]
    fn test_decode_leader_maps_ids_to_candidates() {
        assert_eq!(decode_leader(&abi_int(1)).unwrap(), Candidate::A);
        assert_eq!(decode_leader(&abi_int(2)).unwrap(), Candidate::B);
        assert_eq!(Candidate::A.label(), "Trump");
    }

    #[test]
    fn test_decode_leader_negative_sentinel_is_error() {
        let err = decode_leader(&abi_int(-1)).unwrap_err();
        assert_eq!(err.method, "currentLeader");
        assert_eq!(err.message, "Unsuccessful transaction!");
    }

    #[test]
    fn test_decode_leader_unknown_id_is_error() {
        assert!(decode_leader(&abi_int(0)).is_err());
        assert!(decode_leader(&abi_int(7)).is_err());
    }

    #[test]
    fn test_decode_seats_and_bool() {
        assert_eq!(decode_seats(&abi_uint(18)).unwrap(), 18);
        assert!(decode_bool(&abi_bool(true)).unwrap());
        assert!(decode_seats(&Bytes::new()).is_err());
    }

    // ==================== describe_log ====================

    #[test]
    fn test_describe_log_state_result() {
        let event = &abi().log_state_result;
        let data = ethers::abi::encode(&[
            Token::Uint(U256::from(1)),
            Token::Uint(U256::from(18)),
            Token::String("OH".into()),
        ]);
        let log = Log {
            address: Address::repeat_byte(0xee),
            topics: vec![event.signature()],
            data: data.into(),
            ..Default::default()
        };
        assert_eq!(describe_log(&log), "[event: LogStateResult] Trump won 18 seat(s) in OH");
    }

    #[test]
    fn test_describe_log_unknown_event_is_raw() {
        let log = Log {
            address: Address::repeat_byte(0xee),
            topics: vec![H256::repeat_byte(9)],
            data: vec![0xde, 0xad].into(),
            ..Default::default()
        };
        assert!(describe_log(&log).ends_with("0xdead"));
    }

    // ==================== client calls ====================

    #[tokio::test]
    async fn test_seat_counts_reads_both_candidates() {
        let wallet = MockWallet::new();
        wallet.set_seats(5, 9);
        let counts = contract_for(&wallet).seat_counts().await.unwrap();
        assert_eq!(counts, SeatCounts { a: 5, b: 9 });
        assert_eq!(counts.get(Candidate::B), 9);
    }

    #[tokio::test]
    async fn test_read_failure_carries_raw_message() {
        let wallet = MockWallet::new();
        wallet.fail_reads("execution reverted");
        let err = contract_for(&wallet).election_ended().await.unwrap_err();
        assert_eq!(err.method, "electionEnded");
        assert_eq!(err.message, "execution reverted");
    }

    #[tokio::test]
    async fn test_submit_returns_hash_on_acceptance() {
        let wallet = MockWallet::new();
        let hash = H256::from_low_u64_be(0xabc);
        wallet.push_tx_hash(hash);
        let result = StateResult {
            region: "OH".into(),
            votes_a: 5,
            votes_b: 3,
            seats: 18,
        };
        let pending = contract_for(&wallet).submit_state_result(&result).await.unwrap();
        assert_eq!(pending.tx_hash, hash);
        assert_eq!(wallet.sent_calldata(), vec![submit_state_result_calldata(&result).unwrap()]);
    }

    #[tokio::test]
    async fn test_receipt_status() {
        let wallet = MockWallet::new();
        let hash = H256::from_low_u64_be(0xabc);
        wallet.release_receipt(hash, 0);
        let receipt = contract_for(&wallet).wait_for_receipt(hash).await.unwrap();
        assert!(!receipt.is_success());
        assert_eq!(receipt.tx_hash, hash);
    }
}
