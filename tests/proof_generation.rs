mod common;

use std::collections::HashSet;
use std::sync::Arc;

use alloy_primitives::U256;

use common::{identity, MockProver};
use zkvote_client::identity::commitment_of_secret;
use zkvote_client::merkle::{verify_merkle_proof, MembershipTree};
use zkvote_client::prover::{
    scope_proposal_id, DepthValue, ProofError, ProofGenerator, ProofRequest, PROOF_POINTS,
};
use zkvote_client::utils::{field_to_u256, u256_to_field};

fn generator(prover: MockProver) -> (ProofGenerator, Arc<MockProver>) {
    let prover = Arc::new(prover);
    (ProofGenerator::new(prover.clone()), prover)
}

fn members(seeds: &[u8]) -> Vec<U256> {
    seeds.iter().map(|seed| identity(*seed).commitment()).collect()
}

#[tokio::test]
async fn test_bundle_is_bound_to_the_fetched_group() {
    let (generator, _) = generator(MockProver::new());
    let group = members(&[1, 2, 3, 4, 5]);
    let voter = identity(4);

    let bundle = generator
        .generate_proof(ProofRequest {
            identity: &voter,
            group_members: &group,
            proposal_id: 7,
            option_id: 1,
        })
        .await
        .unwrap();

    // Rebuilt independently from the same ordered list
    let tree = MembershipTree::from_members(&group).unwrap();
    assert_eq!(Some(bundle.merkle_tree_root), tree.root());

    let path = tree.proof(3).unwrap();
    assert!(verify_merkle_proof(&path, tree.depth()).unwrap());
    assert_eq!(bundle.merkle_tree_depth, path.siblings.len() as u64);
    assert_eq!(bundle.merkle_tree_depth, 3);

    assert_eq!(bundle.message, U256::from(1u64));
    assert_eq!(scope_proposal_id(bundle.scope), U256::from(7u64));
    assert_eq!(bundle.points.len(), PROOF_POINTS);
    assert!(bundle.sanity_check());

    let nullifier = voter.nullifier(u256_to_field(bundle.scope).unwrap()).unwrap();
    assert_eq!(bundle.nullifier, field_to_u256(nullifier));
}

#[tokio::test]
async fn test_single_member_group_has_depth_one() {
    let (generator, _) = generator(MockProver::new());
    let voter = identity(1);
    let group = vec![voter.commitment()];

    let bundle = generator
        .generate_proof(ProofRequest {
            identity: &voter,
            group_members: &group,
            proposal_id: 1,
            option_id: 0,
        })
        .await
        .unwrap();

    assert_eq!(bundle.merkle_tree_depth, 1);
    assert_eq!(bundle.merkle_tree_root, voter.commitment());
    assert_eq!(bundle.message, U256::ZERO);
}

#[tokio::test]
async fn test_non_member_is_rejected_before_proving() {
    let (generator, prover) = generator(MockProver::new());
    let outsider = identity(9);

    let result = generator
        .generate_proof(ProofRequest {
            identity: &outsider,
            group_members: &members(&[1, 2]),
            proposal_id: 1,
            option_id: 0,
        })
        .await;

    match result {
        Err(ProofError::NotAMember { commitment }) => assert_eq!(commitment, outsider.commitment()),
        other => panic!("expected NotAMember, got {:?}", other),
    }
    assert_eq!(prover.calls(), 0);
}

#[tokio::test]
async fn test_empty_group_is_invalid_input() {
    let (generator, prover) = generator(MockProver::new());

    let result = generator
        .generate_proof(ProofRequest {
            identity: &identity(1),
            group_members: &[],
            proposal_id: 1,
            option_id: 0,
        })
        .await;

    assert!(matches!(result, Err(ProofError::InvalidInput(_))));
    assert_eq!(prover.calls(), 0);
}

#[tokio::test]
async fn test_zero_commitment_in_group_is_invalid_input() {
    let (generator, _) = generator(MockProver::new());
    let voter = identity(1);
    let group = vec![U256::ZERO, voter.commitment()];

    let result = generator
        .generate_proof(ProofRequest {
            identity: &voter,
            group_members: &group,
            proposal_id: 1,
            option_id: 0,
        })
        .await;

    assert!(matches!(result, Err(ProofError::InvalidInput(_))));
}

#[tokio::test]
async fn test_scopes_never_repeat() {
    let (generator, _) = generator(MockProver::new());
    let voter = identity(2);
    let group = members(&[1, 2]);

    let mut scopes = HashSet::new();
    let mut nullifiers = HashSet::new();
    for _ in 0..1000 {
        let bundle = generator
            .generate_proof(ProofRequest {
                identity: &voter,
                group_members: &group,
                proposal_id: 3,
                option_id: 0,
            })
            .await
            .unwrap();
        assert_eq!(scope_proposal_id(bundle.scope), U256::from(3u64));
        scopes.insert(bundle.scope);
        nullifiers.insert(bundle.nullifier);
    }

    assert_eq!(scopes.len(), 1000);
    assert_eq!(nullifiers.len(), 1000);
}

#[tokio::test]
async fn test_string_depth_from_prover_is_accepted() {
    let mut prover = MockProver::new();
    prover.depth = |depth| DepthValue::Text(depth.to_string());
    let (generator, _) = generator(prover);
    let voter = identity(1);

    let bundle = generator
        .generate_proof(ProofRequest {
            identity: &voter,
            group_members: &members(&[1, 2, 3]),
            proposal_id: 1,
            option_id: 2,
        })
        .await
        .unwrap();
    assert_eq!(bundle.merkle_tree_depth, 2);
}

#[tokio::test]
async fn test_wrong_depth_from_prover_fails() {
    let mut prover = MockProver::new();
    prover.depth = |depth| DepthValue::Number(depth + 1);
    let (generator, _) = generator(prover);

    let result = generator
        .generate_proof(ProofRequest {
            identity: &identity(1),
            group_members: &members(&[1, 2]),
            proposal_id: 1,
            option_id: 0,
        })
        .await;

    assert!(matches!(result, Err(ProofError::ProverFailure(_))));
}

#[tokio::test]
async fn test_short_proof_fails() {
    let mut prover = MockProver::new();
    prover.point_count = PROOF_POINTS - 1;
    let (generator, _) = generator(prover);

    let result = generator
        .generate_proof(ProofRequest {
            identity: &identity(1),
            group_members: &members(&[1, 2]),
            proposal_id: 1,
            option_id: 0,
        })
        .await;

    match result {
        Err(ProofError::ProverFailure(message)) => assert!(message.contains("proof points")),
        other => panic!("expected ProverFailure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_proof_for_another_root_fails() {
    let mut prover = MockProver::new();
    prover.tamper_root = true;
    let (generator, _) = generator(prover);

    let result = generator
        .generate_proof(ProofRequest {
            identity: &identity(2),
            group_members: &members(&[1, 2]),
            proposal_id: 1,
            option_id: 0,
        })
        .await;

    match result {
        Err(ProofError::ProverFailure(message)) => assert!(message.contains("root")),
        other => panic!("expected ProverFailure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_group_root_rebuilds_from_prover_secret() {
    let (generator, prover) = generator(MockProver::new());
    let group = members(&[1, 2, 3]);
    let voter = identity(3);

    // The circuit recomputes the leaf from the secret alone
    let leaf = commitment_of_secret(voter.secret_scalar()).unwrap();
    assert_eq!(leaf, voter.commitment());

    let mut rebuilt = group.clone();
    rebuilt[2] = leaf;
    let tree = MembershipTree::from_members(&rebuilt).unwrap();

    let bundle = generator
        .generate_proof(ProofRequest {
            identity: &voter,
            group_members: &group,
            proposal_id: 3,
            option_id: 2,
        })
        .await
        .unwrap();
    assert_eq!(Some(bundle.merkle_tree_root), tree.root());
    assert_eq!(prover.calls(), 1);
}
