//! Seed an ERC20 contract and N independent holder accounts, each
//! self-transferring its one token, then check that running the block
//! sequentially and in parallel produces identical receipts and roots —
//! every transaction touches a distinct storage slot, so nothing should
//! ever abort or retry either way.

use std::num::NonZeroUsize;
use std::sync::Arc;

use alloy_primitives::{address, bytes, keccak256, Address, Bytes, B256, U256};
use alloy_rpc_types::{Block, BlockTransactions, Header, Transaction};
use evm_core::chunk::INVALID_OFFSET;
use evm_core::state_db::{Account, BlockState, StateDb, WriteSet};
use evm_core::storage_pool::{OpenMode, PoolConfig, StoragePool};
use evm_core::{execute_block, metrics::NoopMetrics, ExecutorConfig};

const ERC20_ADDRESS: Address = address!("fbfbfddd6e35da57b7b0f9a2c10e34be70b3a4e9");

fn erc20_code() -> Bytes {
    bytes!("608060405234801561001057600080fd5b50600436106100a95760003560e01c8063395093511161007157806339509351146101d957806370a082311461020557806395d89b411461022b578063a457c2d714610233578063a9059cbb1461025f578063dd62ed3e1461028b576100a9565b806306fdde03146100ae578063095ea7b31461012b57806318160ddd1461016b57806323b872dd14610185578063313ce567146101bb575b600080fd5b6100b66102b9565b6040805160208082528351818301528351919283929083019185019080838360005b838110156100f05781810151838201526020016100d8565b50505050905090810190601f16801561011d5780820380516001836020036101000a031916815260200191505b509250505060405180910390f35b6101576004803603604081101561014157600080fd5b506001600160a01b03813516906020013561034f565b604080519115158252519081900360200190f35b61017361036c565b60408051918252519081900360200190f35b6101576004803603606081101561019b57600080fd5b506001600160a01b03813581169160208101359091169060400135610372565b6101c36103f9565b6040805160ff9092168252519081900360200190f35b610157600480360360408110156101ef57600080fd5b506001600160a01b038135169060200135610402565b6101736004803603602081101561021b57600080fd5b50356001600160a01b0316610450565b6100b661046b565b6101576004803603604081101561024957600080fd5b506001600160a01b0381351690602001356104cc565b6101576004803603604081101561027557600080fd5b506001600160a01b038135169060200135610534565b610173600480360360408110156102a157600080fd5b506001600160a01b0381358116916020013516610548565b60038054604080516020601f60026000196101006001881615020190951694909404938401819004810282018101909252828152606093909290918301828280156103455780601f1061031a57610100808354040283529160200191610345565b820191906000526020600020905b81548152906001019060200180831161032857829003601f168201915b5050505050905090565b600061036361035c6105d4565b84846105d8565b50600192915050565b60025490565b600061037f8484846106c4565b6103ef8461038b6105d4565b6103ea85604051806060016040528060288152602001610927602891396001600160a01b038a166000908152600160205260408120906103c96105d4565b6001600160a01b03168152602081019190915260400160002054919061081f565b6105d8565b5060019392505050565b60055460ff1690565b600061036361040f6105d4565b846103ea85600160006104206105d4565b6001600160a01b03908116825260208083019390935260409182016000908120918c168152925290205490610573565b6001600160a01b031660009081526020819052604090205490565b60048054604080516020601f60026000196101006001881615020190951694909404938401819004810282018101909252828152606093909290918301828280156103455780601f1061031a57610100808354040283529160200191610345565b60006103636104d96105d4565b846103ea8560405180606001604052806025815260200161099860259139600160006105036105d4565b6001600160a01b03908116825260208083019390935260409182016000908120918d1681529252902054919061081f565b60006103636105416105d4565b84846106c4565b6001600160a01b03918216600090815260016020908152604080832093909416825291909152205490565b6000828201838110156105cd576040805162461bcd60e51b815260206004820152601b60248201527f536166654d6174683a206164646974696f6e206f766572666c6f770000000000604482015290519081900360640190fd5b9392505050565b3390565b6001600160a01b03831661061d5760405162461bcd60e51b81526004018080602001828103825260248152602001806109746024913960400191505060405180910390fd5b6001600160a01b0382166106625760405162461bcd60e51b81526004018080602001828103825260228152602001806108df6022913960400191505060405180910390fd5b6001600160a01b03808416600081815260016020908152604080832094871680845294825291829020859055815185815291517f8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b9259281900390910190a3505050565b6001600160a01b0383166107095760405162461bcd60e51b815260040180806020018281038252602581526020018061094f6025913960400191505060405180910390fd5b6001600160a01b03821661074e5760405162461bcd60e51b81526004018080602001828103825260238152602001806108bc6023913960400191505060405180910390fd5b6107598383836108b6565b61079681604051806060016040528060268152602001610901602691396001600160a01b038616600090815260208190526040902054919061081f565b6001600160a01b0380851660009081526020819052604080822093909355908416815220546107c59082610573565b6001600160a01b038084166000818152602081815260409182902094909455805185815290519193928716927fddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef92918290030190a3505050565b600081848411156108ae5760405162461bcd60e51b81526004018080602001828103825283818151815260200191508051906020019080838360005b8381101561087357818101518382015260200161085b565b50505050905090810190601f1680156108a05780820380516001836020036101000a031916815260200191505b509250505060405180910390fd5b505050900390565b50505056fe45524332303a207472616e7366657220746f20746865207a65726f206164647265737345524332303a20617070726f766520746f20746865207a65726f206164647265737345524332303a207472616e7366657220616d6f756e7420657863656564732062616c616e636545524332303a207472616e7366657220616d6f756e74206578636565647320616c6c6f77616e636545524332303a207472616e736665722066726f6d20746865207a65726f206164647265737345524332303a20617070726f76652066726f6d20746865207a65726f206164647265737345524332303a2064656372656173656420616c6c6f77616e63652062656c6f77207a65726fa2646970667358221220af410612545251aac98e209cf5be29983b4a961bded32de26d3322fdc6305ef864736f6c63430007060033")
}

fn balance_slot(holder: Address) -> U256 {
    let mut preimage = [0u8; 64];
    preimage[12..32].copy_from_slice(holder.as_slice());
    // slot 0: _balances mapping
    U256::from_be_bytes(keccak256(preimage).0)
}

fn open_state_db(dir: &tempfile::TempDir) -> StateDb {
    let pool = Arc::new(
        StoragePool::open(&PoolConfig {
            path: dir.path().join("pool.dat"),
            chunk_capacity: 1 << 20,
            sequential_chunk_count: 16,
            mode: OpenMode::CreateIfNeeded,
        })
        .unwrap(),
    );
    StateDb {
        accounts: evm_core::mpt::Mpt::open(pool.clone(), 16),
        storage: evm_core::mpt::Mpt::open(pool.clone(), 16),
        code: evm_core::mpt::Mpt::open(pool.clone(), 16),
        receipts: evm_core::mpt::Mpt::open(pool, 16),
    }
}

fn seed_genesis(db: &StateDb, holders: &[Address]) -> (u64, (evm_core::chunk::ChunkOffset, evm_core::chunk::ChunkOffset, evm_core::chunk::ChunkOffset)) {
    let code = erc20_code();
    let code_hash = keccak256(&code);

    let mut writes = WriteSet::default();
    writes.accounts.insert(ERC20_ADDRESS, Some(Account { nonce: 1, balance: U256::ZERO, storage_root: B256::ZERO, code_hash }));
    writes.code.insert(code_hash, Some(code.to_vec()));
    writes.storage.insert((ERC20_ADDRESS, U256::from(2)), Some(U256::from(1_000_000u64) * U256::from(10u64).pow(U256::from(18u64))));

    for &holder in holders {
        writes.accounts.insert(holder, Some(Account { nonce: 0, balance: U256::from(1u128) << 100, storage_root: B256::ZERO, code_hash: revm::primitives::KECCAK_EMPTY }));
        writes.storage.insert((ERC20_ADDRESS, balance_slot(holder)), Some(U256::from(1u64)));
    }

    let mut block_state = BlockState::default();
    block_state.merge(writes);
    let roots = block_state.flush(db, 0, 1, (INVALID_OFFSET, INVALID_OFFSET, INVALID_OFFSET)).unwrap();
    db.accounts.commit(1, roots.0).unwrap();
    db.storage.commit(1, roots.1).unwrap();
    db.code.commit(1, roots.2).unwrap();
    (1, roots)
}

fn transfer_calldata(to: Address) -> Bytes {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&[0xa9, 0x05, 0x90, 0xcb]);
    data.extend_from_slice(B256::left_padding_from(to.as_slice()).as_slice());
    data.extend_from_slice(B256::from(U256::from(1u64)).as_slice());
    Bytes::from(data)
}

fn transfer_block(holders: &[Address]) -> Block<Transaction> {
    let transactions: Vec<Transaction> = holders
        .iter()
        .map(|&holder| Transaction {
            from: holder,
            to: Some(ERC20_ADDRESS),
            value: U256::ZERO,
            gas: 65_536,
            gas_price: Some(3_000_000_000),
            nonce: 0,
            input: transfer_calldata(holder),
            ..Default::default()
        })
        .collect();

    let mut header = Header::default();
    header.number = 20_000_000;
    header.gas_limit = 30_000_000;
    header.gas_used = 65_536 * holders.len() as u64;
    Block { header, transactions: BlockTransactions::Full(transactions), ..Default::default() }
}

fn random_address(seed: u64) -> Address {
    Address::left_padding_from(&keccak256(seed.to_be_bytes()).0[..20])
}

#[test]
fn erc20_self_transfers_match_between_sequential_and_parallel() {
    const N: u64 = 200;
    let holders: Vec<Address> = (0..N).map(random_address).collect();
    let block = transfer_block(&holders);
    let concurrency_level = std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN);

    let sequential_dir = tempfile::tempdir().unwrap();
    let sequential_db = open_state_db(&sequential_dir);
    let (base_version, base_roots) = seed_genesis(&sequential_db, &holders);
    let sequential_config = ExecutorConfig { concurrency_level, force_sequential: true, ..Default::default() };
    let sequential_result = execute_block(&sequential_db, base_version, base_roots, base_version + 1, &block, &sequential_config, &NoopMetrics).unwrap();

    let parallel_dir = tempfile::tempdir().unwrap();
    let parallel_db = open_state_db(&parallel_dir);
    let (base_version, base_roots) = seed_genesis(&parallel_db, &holders);
    let parallel_config = ExecutorConfig { concurrency_level, force_sequential: false, ..Default::default() };
    let parallel_result = execute_block(&parallel_db, base_version, base_roots, base_version + 1, &block, &parallel_config, &NoopMetrics).unwrap();

    assert_eq!(sequential_result.receipts, parallel_result.receipts);
    assert_eq!(sequential_result.gas_used, parallel_result.gas_used);
    assert_eq!(sequential_result.roots, parallel_result.roots);
    assert!(sequential_result.receipts.iter().all(|r| r.success));
}
