//! IKEv2 core benchmarks
//!
//! Proposal selection, key derivation and IKE_SA checkout/checkin.
//!
//! Run with: `cargo bench --features ipsec --bench ike_bench`

#![cfg(feature = "ipsec")]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vigil_platform::{DhFactory, DiffieHellman, Packet, PlatformError, PlatformResult, Transport};
use vigil_proto::ipsec::child_sa::MemoryChildSaFactory;
use vigil_proto::ipsec::config::StaticConfigStore;
use vigil_proto::ipsec::crypto::{KeyMaterial, KeySizes};
use vigil_proto::ipsec::ikev2::{
    select_proposal, DhTransformId, EncrTransformId, IkeSaManager, IntegTransformId, Message,
    MessageCodec, PrfTransformId, Proposal, ProtocolId, PskAuthenticator, Services, Transform,
    IKE_MAJOR_VERSION,
};
use vigil_proto::ipsec::Result;

/// Create a peer offer with `count` proposals, the acceptable one last
fn create_test_offer(count: u8) -> Vec<Proposal> {
    (1..=count)
        .map(|num| {
            let proposal = Proposal::new(num, ProtocolId::Ike)
                .add_transform(Transform::prf(PrfTransformId::HmacSha256))
                .add_transform(Transform::dh(DhTransformId::Group14));
            if num == count {
                proposal.add_transform(Transform::encr_with_key(EncrTransformId::AesGcm16, 128))
            } else {
                proposal
                    .add_transform(Transform::encr_with_key(EncrTransformId::AesCbc, 256))
                    .add_transform(Transform::integ(IntegTransformId::HmacSha256_128))
            }
        })
        .collect()
}

fn create_test_local() -> Vec<Proposal> {
    vec![Proposal::new(1, ProtocolId::Ike)
        .add_transform(Transform::encr_with_key(EncrTransformId::AesGcm16, 128))
        .add_transform(Transform::prf(PrfTransformId::HmacSha256))
        .add_transform(Transform::dh(DhTransformId::Group14))]
}

struct NullCodec;

impl MessageCodec for NullCodec {
    fn generate(&self, _message: &Message, _keys: Option<&KeyMaterial>) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn parse_body(&self, _message: &mut Message, _keys: Option<&KeyMaterial>) -> Result<()> {
        Ok(())
    }
}

struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _packet: &Packet) -> PlatformResult<()> {
        Ok(())
    }
}

struct NoDh;

impl DhFactory for NoDh {
    fn create(&self, group: u16) -> PlatformResult<Box<dyn DiffieHellman>> {
        Err(PlatformError::Crypto(format!("DH group {} not available", group)))
    }
}

fn create_test_manager() -> IkeSaManager {
    IkeSaManager::new(Arc::new(Services::new(
        Arc::new(StaticConfigStore::new()),
        Arc::new(NullCodec),
        Arc::new(NullTransport),
        Arc::new(PskAuthenticator::new("bench")),
        Arc::new(MemoryChildSaFactory::new()),
        Arc::new(NoDh),
    )))
}

fn bench_proposal_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("proposal_selection");
    let local = create_test_local();

    for count in [1u8, 4, 16] {
        let offer = create_test_offer(count);
        group.bench_function(format!("select_{}_offered", count), |b| {
            b.iter(|| black_box(select_proposal(&local, &offer).unwrap()))
        });
    }

    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");
    let proposal = create_test_local().remove(0);
    let sizes = KeySizes::from_proposal(&proposal).unwrap();
    let nonce_i = vec![0x11u8; 32];
    let nonce_r = vec![0x22u8; 32];
    let secret = vec![0xDDu8; 256];

    group.bench_function("derive_ike_keys", |b| {
        b.iter(|| {
            black_box(
                KeyMaterial::derive(sizes, &nonce_i, &nonce_r, &secret, 0x0102, 0x0304).unwrap(),
            )
        })
    });

    let keys = KeyMaterial::derive(sizes, &nonce_i, &nonce_r, &secret, 0x0102, 0x0304).unwrap();
    group.bench_function("derive_rekey", |b| {
        b.iter(|| {
            black_box(
                KeyMaterial::derive_rekey(&keys, sizes, &nonce_i, &nonce_r, &secret, 0x0506, 0x0708)
                    .unwrap(),
            )
        })
    });

    group.bench_function("child_keymat", |b| {
        b.iter(|| black_box(keys.child_keymat(&nonce_i, &nonce_r, 72).unwrap()))
    });

    group.finish();
}

fn bench_checkout(c: &mut Criterion) {
    let mut group = c.benchmark_group("ike_sa_manager");
    let manager = create_test_manager();

    let mut ids = Vec::new();
    for _ in 0..1000 {
        let sa = manager.checkout_new(IKE_MAJOR_VERSION, true);
        ids.push(sa.id());
        manager.checkin(sa);
    }

    group.bench_function("checkout_checkin", |b| {
        let mut next = 0;
        b.iter(|| {
            let sa = manager.checkout(&ids[next % ids.len()]).unwrap();
            next += 1;
            manager.checkin(black_box(sa));
        })
    });

    group.bench_function("checkout_new_destroy", |b| {
        b.iter(|| {
            let sa = manager.checkout_new(IKE_MAJOR_VERSION, true);
            manager.checkin_and_destroy(black_box(sa));
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_proposal_selection,
    bench_key_derivation,
    bench_checkout
);
criterion_main!(benches);
