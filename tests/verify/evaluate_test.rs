//! Tests for per-signature checks and verdict reduction.

use cosign_gate::registry::{ImageReference, SignatureArtifact};
use cosign_gate::verify::payload::ClaimMismatch;
use cosign_gate::verify::{check_signature, evaluate, SignatureRejection, VerificationVerdict};

use crate::support::{app_image, sha256_digest, TestSigner, DIGEST_A, DIGEST_B, REGISTRY};

fn image() -> ImageReference {
    ImageReference::parse(&app_image("1.0")).expect("valid reference")
}

fn reference() -> String {
    format!("{REGISTRY}/app")
}

#[test]
fn one_good_signature_among_bad_ones_verifies() {
    let trusted = TestSigner::generate();
    let stranger = TestSigner::generate();
    let artifacts = vec![
        stranger.artifact(&reference(), DIGEST_A),
        trusted.artifact(&reference(), DIGEST_B),
        trusted.artifact(&reference(), DIGEST_A),
    ];
    let verdict = evaluate(&image(), DIGEST_A, &artifacts, &trusted.verification_key());
    assert!(verdict.is_verified());
}

#[test]
fn all_rejected_reports_how_many_were_checked() {
    let trusted = TestSigner::generate();
    let stranger = TestSigner::generate();
    let artifacts = vec![
        stranger.artifact(&reference(), DIGEST_A),
        stranger.artifact(&reference(), DIGEST_A),
    ];
    let verdict = evaluate(&image(), DIGEST_A, &artifacts, &trusted.verification_key());
    assert_eq!(
        verdict,
        VerificationVerdict::Unverified {
            digest: DIGEST_A.to_owned(),
            signatures_checked: 2
        }
    );
}

#[test]
fn payload_must_hash_to_layer_digest() {
    let signer = TestSigner::generate();
    let mut artifact = signer.artifact(&reference(), DIGEST_A);
    artifact.layer_digest = DIGEST_B.to_owned();

    let rejection = check_signature(&artifact, &image(), DIGEST_A, &signer.verification_key())
        .expect_err("digest mismatch");
    assert!(matches!(
        rejection,
        SignatureRejection::PayloadDigestMismatch { .. }
    ));
}

#[test]
fn missing_or_garbled_annotation_is_rejected() {
    let signer = TestSigner::generate();
    let key = signer.verification_key();

    let mut unsigned = signer.artifact(&reference(), DIGEST_A);
    unsigned.signature = None;
    assert_eq!(
        check_signature(&unsigned, &image(), DIGEST_A, &key),
        Err(SignatureRejection::MissingSignature)
    );

    let mut garbled = signer.artifact(&reference(), DIGEST_A);
    garbled.signature = Some("!!not base64!!".to_owned());
    assert_eq!(
        check_signature(&garbled, &image(), DIGEST_A, &key),
        Err(SignatureRejection::Undecodable)
    );
}

#[test]
fn signed_claims_for_another_repository_are_rejected() {
    let signer = TestSigner::generate();
    let artifact = signer.artifact("registry.example.com/other/app", DIGEST_A);
    let rejection = check_signature(&artifact, &image(), DIGEST_A, &signer.verification_key())
        .expect_err("foreign repository");
    assert!(matches!(
        rejection,
        SignatureRejection::Claims(ClaimMismatch::RepositoryMismatch { .. })
    ));
}

#[test]
fn validly_signed_garbage_is_rejected_as_claims() {
    let signer = TestSigner::generate();
    let payload = b"not a simple signing document".to_vec();
    let artifact = SignatureArtifact {
        layer_digest: sha256_digest(&payload),
        signature: Some(signer.sign(&payload)),
        payload,
    };
    let rejection = check_signature(&artifact, &image(), DIGEST_A, &signer.verification_key())
        .expect_err("not a payload");
    assert!(matches!(
        rejection,
        SignatureRejection::Claims(ClaimMismatch::Malformed(_))
    ));
}
