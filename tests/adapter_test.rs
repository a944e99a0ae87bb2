mod common;

use keel::common::{Config, PAGE_SIZE};
use keel::index::{key, Adapter, Record};

use common::with_engine;

/// Fixed-size account record keyed by a u64 id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Account {
    balance: i64,
    name: [u8; 16],
}

impl Record for Account {
    type Key = u64;

    fn fold_key(key: &u64, out: &mut Vec<u8>) {
        key::fold_u64(out, *key);
    }

    fn unfold_key(bytes: &[u8]) -> u64 {
        key::unfold_u64(bytes)
    }

    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.balance.to_le_bytes());
        out.extend_from_slice(&self.name);
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            balance: i64::from_le_bytes(bytes[..8].try_into().unwrap()),
            name: bytes[8..24].try_into().unwrap(),
        }
    }
}

fn account(i: u64) -> Account {
    let mut name = [0u8; 16];
    name[..8].copy_from_slice(&i.to_be_bytes());
    Account {
        balance: i as i64 * 10,
        name,
    }
}

fn cfg() -> Config {
    Config {
        phys_size: 128 * PAGE_SIZE as u64,
        ..Config::default()
    }
}

#[test]
fn test_adapter_insert_lookup() {
    with_engine(cfg(), |bm| {
        let table: Adapter<Account> = Adapter::new(bm);

        for i in 0..500u64 {
            table.insert(&i, &account(i));
        }

        for i in 0..500u64 {
            let got = table.lookup1(&i, |r| r.clone());
            assert_eq!(got, Some(account(i)), "record {i}");
        }
        assert_eq!(table.lookup1(&9999, |r| r.clone()), None);
        assert_eq!(table.count(), 500);
    });
}

#[test]
fn test_adapter_update1() {
    with_engine(cfg(), |bm| {
        let table: Adapter<Account> = Adapter::new(bm);
        table.insert(&7, &account(7));

        let updated = table.update1(&7, |r| {
            r.balance += 5;
        });
        assert!(updated);
        assert_eq!(table.lookup1(&7, |r| r.balance), Some(75));

        assert!(!table.update1(&8, |_| ()));
    });
}

#[test]
fn test_adapter_erase() {
    with_engine(cfg(), |bm| {
        let table: Adapter<Account> = Adapter::new(bm);
        for i in 0..100u64 {
            table.insert(&i, &account(i));
        }

        assert!(table.erase(&50));
        assert!(!table.erase(&50));
        assert_eq!(table.lookup1(&50, |r| r.clone()), None);
        assert_eq!(table.count(), 99);
    });
}

#[test]
fn test_adapter_scan_yields_typed_keys_in_order() {
    with_engine(cfg(), |bm| {
        let table: Adapter<Account> = Adapter::new(bm);
        for i in 0..300u64 {
            table.insert(&i, &account(i));
        }

        let mut keys = Vec::new();
        table.scan(&100, |k, r| {
            assert_eq!(r.balance, *k as i64 * 10);
            keys.push(*k);
            true
        });
        assert_eq!(keys, (100..300).collect::<Vec<_>>());

        let mut down = Vec::new();
        table.scan_desc(&100, |k, _| {
            down.push(*k);
            true
        });
        assert_eq!(down, (0..=100).rev().collect::<Vec<_>>());
    });
}

#[test]
fn test_adapter_two_tables_are_disjoint() {
    with_engine(cfg(), |bm| {
        let accounts: Adapter<Account> = Adapter::new(std::sync::Arc::clone(&bm));
        let archive: Adapter<Account> = Adapter::new(bm);

        accounts.insert(&1, &account(1));
        assert_eq!(archive.lookup1(&1, |r| r.clone()), None);
        assert_eq!(archive.count(), 0);
        assert_eq!(accounts.count(), 1);
    });
}
