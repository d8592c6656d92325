//! Tests for the registry-backed image verifier.

use std::sync::Arc;

use cosign_gate::event::ContainerImage;
use cosign_gate::registry::{CredentialHelper, SignatureStore};
use cosign_gate::verify::{FailureKind, ImageVerification, ImageVerifier, VerificationVerdict};

use crate::support::{
    app_image, container, FakeCredentials, FakeStore, TestSigner, DIGEST_A, DIGEST_B, REGISTRY,
};

fn verifier(credentials: &Arc<FakeCredentials>, store: &Arc<FakeStore>) -> ImageVerifier {
    ImageVerifier::new(
        Arc::clone(credentials) as Arc<dyn CredentialHelper>,
        Arc::clone(store) as Arc<dyn SignatureStore>,
    )
}

fn signed_reference() -> String {
    format!("{REGISTRY}/app")
}

#[tokio::test]
async fn valid_signature_is_verified() {
    let signer = TestSigner::generate();
    let store = Arc::new(
        FakeStore::new()
            .tag("app:1.0", DIGEST_A)
            .signature(DIGEST_A, signer.artifact(&signed_reference(), DIGEST_A)),
    );
    let credentials = Arc::new(FakeCredentials::anonymous());

    let verdict = verifier(&credentials, &store)
        .verify(&container(&app_image("1.0")), &signer.verification_key())
        .await;
    assert_eq!(
        verdict,
        VerificationVerdict::Verified {
            digest: DIGEST_A.to_owned()
        }
    );
    assert_eq!(credentials.calls(), 1);
}

#[tokio::test]
async fn image_without_signatures_is_unverified() {
    let store = Arc::new(FakeStore::new().tag("app:bad", DIGEST_B));
    let credentials = Arc::new(FakeCredentials::anonymous());

    let verdict = verifier(&credentials, &store)
        .verify(
            &container(&app_image("bad")),
            &TestSigner::generate().verification_key(),
        )
        .await;
    assert_eq!(
        verdict,
        VerificationVerdict::Unverified {
            digest: DIGEST_B.to_owned(),
            signatures_checked: 0
        }
    );
}

#[tokio::test]
async fn signature_from_untrusted_key_is_unverified() {
    let trusted = TestSigner::generate();
    let attacker = TestSigner::generate();
    let store = Arc::new(
        FakeStore::new()
            .tag("app:1.0", DIGEST_A)
            .signature(DIGEST_A, attacker.artifact(&signed_reference(), DIGEST_A)),
    );

    let verdict = verifier(&Arc::new(FakeCredentials::anonymous()), &store)
        .verify(&container(&app_image("1.0")), &trusted.verification_key())
        .await;
    assert!(verdict.is_unverified(), "got {verdict:?}");
}

#[tokio::test]
async fn signature_for_another_digest_is_unverified() {
    let signer = TestSigner::generate();
    // A valid signature over DIGEST_B replayed under DIGEST_A's signature tag.
    let store = Arc::new(
        FakeStore::new()
            .tag("app:1.0", DIGEST_A)
            .signature(DIGEST_A, signer.artifact(&signed_reference(), DIGEST_B)),
    );

    let verdict = verifier(&Arc::new(FakeCredentials::anonymous()), &store)
        .verify(&container(&app_image("1.0")), &signer.verification_key())
        .await;
    assert_eq!(
        verdict,
        VerificationVerdict::Unverified {
            digest: DIGEST_A.to_owned(),
            signatures_checked: 1
        }
    );
}

#[tokio::test]
async fn credential_failure_is_a_verification_error() {
    let store = Arc::new(FakeStore::new().tag("app:1.0", DIGEST_A));
    let credentials = Arc::new(FakeCredentials::failing());

    let verdict = verifier(&credentials, &store)
        .verify(
            &container(&app_image("1.0")),
            &TestSigner::generate().verification_key(),
        )
        .await;
    match verdict {
        VerificationVerdict::VerificationError(failure) => {
            assert_eq!(failure.kind, FailureKind::Credential);
        }
        other => panic!("expected verification error, got {other:?}"),
    }
    assert_eq!(store.resolve_calls(), 0);
    assert_eq!(store.signature_calls(), 0);
}

#[tokio::test]
async fn unreachable_registry_is_never_verified() {
    let store = Arc::new(FakeStore::unreachable());
    let verdict = verifier(&Arc::new(FakeCredentials::anonymous()), &store)
        .verify(
            &container(&app_image("1.0")),
            &TestSigner::generate().verification_key(),
        )
        .await;
    assert!(
        matches!(
            &verdict,
            VerificationVerdict::VerificationError(failure) if failure.kind == FailureKind::Registry
        ),
        "got {verdict:?}"
    );
}

#[tokio::test]
async fn malformed_reference_is_a_parse_error() {
    let store = Arc::new(FakeStore::new());
    let credentials = Arc::new(FakeCredentials::anonymous());
    let verdict = verifier(&credentials, &store)
        .verify(
            &container("Registry.Example.com/UPPER CASE:tag"),
            &TestSigner::generate().verification_key(),
        )
        .await;
    assert!(
        matches!(
            &verdict,
            VerificationVerdict::VerificationError(failure) if failure.kind == FailureKind::Parse
        ),
        "got {verdict:?}"
    );
    assert_eq!(credentials.calls(), 0);
}

#[tokio::test]
async fn running_digest_is_evaluated_instead_of_the_tag() {
    let signer = TestSigner::generate();
    // The tag has moved on to DIGEST_B; the task still runs DIGEST_A.
    let store = Arc::new(
        FakeStore::new()
            .tag("app:1.0", DIGEST_B)
            .signature(DIGEST_A, signer.artifact(&signed_reference(), DIGEST_A)),
    );
    let running = ContainerImage {
        image_digest: Some(DIGEST_A.to_owned()),
        ..container(&app_image("1.0"))
    };

    let verdict = verifier(&Arc::new(FakeCredentials::anonymous()), &store)
        .verify(&running, &signer.verification_key())
        .await;
    assert!(verdict.is_verified(), "got {verdict:?}");
    assert_eq!(store.resolve_calls(), 0);
}

#[tokio::test]
async fn malformed_running_digest_is_a_parse_error() {
    let store = Arc::new(FakeStore::new());
    let running = ContainerImage {
        image_digest: Some("sha256:short".to_owned()),
        ..container(&app_image("1.0"))
    };
    let verdict = verifier(&Arc::new(FakeCredentials::anonymous()), &store)
        .verify(&running, &TestSigner::generate().verification_key())
        .await;
    assert!(matches!(
        verdict,
        VerificationVerdict::VerificationError(ref failure) if failure.kind == FailureKind::Parse
    ));
}

#[tokio::test]
async fn repository_mismatch_only_warns() {
    let signer = TestSigner::generate();
    let store = Arc::new(
        FakeStore::new()
            .tag("app:1.0", DIGEST_A)
            .signature(DIGEST_A, signer.artifact(&signed_reference(), DIGEST_A)),
    );
    let verifier = verifier(&Arc::new(FakeCredentials::anonymous()), &store)
        .with_expected_repository(Some("other-repo".to_owned()));

    let verdict = verifier
        .verify(&container(&app_image("1.0")), &signer.verification_key())
        .await;
    assert!(verdict.is_verified());
}

#[tokio::test]
async fn repeated_checks_agree() {
    let signer = TestSigner::generate();
    let store = Arc::new(FakeStore::new().tag("app:bad", DIGEST_B));
    let verifier = verifier(&Arc::new(FakeCredentials::anonymous()), &store);
    let key = signer.verification_key();

    let first = verifier.verify(&container(&app_image("bad")), &key).await;
    let second = verifier.verify(&container(&app_image("bad")), &key).await;
    assert_eq!(first, second);
    assert_eq!(store.signature_calls(), 2, "nothing is cached");
}
