//! Protocol authorization

use dwn_engine::protocols::{
    Action, ActionRule, Actor, ConfigureBuilder, Definition, ProtocolType, RuleSet,
};
use dwn_engine::provider::KeyStore;
use dwn_engine::records::{
    Data, QueryBuilder, RecordsFilter, WriteBuilder, WriteProtocol,
};
use dwn_engine::{Error, endpoint};
use http::StatusCode;
use test_node::ProviderImpl;
use test_node::key_store::{ALICE_DID, BOB_DID, CAROL_DID, MALLORY_DID};

const COMMUNITY: &str = "http://community.xyz";

// A community protocol with a contextual participant role gating channel
// messages.
fn community_definition() -> Definition {
    let message_rules = RuleSet {
        actions: Some(vec![ActionRule {
            who: None,
            role: Some("community/gatedChannel/participant".to_string()),
            of: None,
            can: vec![Action::Create],
        }]),
        ..RuleSet::default()
    };

    let channel_rules = RuleSet {
        structure: [
            ("participant".to_string(), RuleSet {
                role: Some(true),
                ..RuleSet::default()
            }),
            ("message".to_string(), message_rules),
        ]
        .into(),
        ..RuleSet::default()
    };

    Definition::new(COMMUNITY)
        .add_type("community", ProtocolType::default())
        .add_type("gatedChannel", ProtocolType::default())
        .add_type("participant", ProtocolType::default())
        .add_type("message", ProtocolType::default())
        .add_rule("community", RuleSet {
            structure: [("gatedChannel".to_string(), channel_rules)].into(),
            ..RuleSet::default()
        })
}

// A participant can create messages in their gated channel; an outsider
// invoking the same role is rejected.
#[tokio::test]
async fn gated_channel_role() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let carol_keyring = provider.keyring(&CAROL_DID).expect("should get Carol's keyring");
    let mallory_keyring = provider.keyring(&MALLORY_DID).expect("should get Mallory's keyring");

    // --------------------------------------------------
    // Alice configures the community protocol.
    // --------------------------------------------------
    let configure = ConfigureBuilder::new()
        .definition(community_definition())
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice creates a community and a gated channel.
    // --------------------------------------------------
    let community = WriteBuilder::new()
        .data(Data::from(b"the community".to_vec()))
        .protocol(WriteProtocol {
            protocol: COMMUNITY.to_string(),
            protocol_path: "community".to_string(),
        })
        .recipient(BOB_DID.as_str())
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, community.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let channel = WriteBuilder::new()
        .data(Data::from(b"a gated channel".to_vec()))
        .protocol(WriteProtocol {
            protocol: COMMUNITY.to_string(),
            protocol_path: "community/gatedChannel".to_string(),
        })
        .parent_context_id(community.context_id.as_ref().expect("should have context"))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, channel.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice adds Carol as a channel participant.
    // --------------------------------------------------
    let participant = WriteBuilder::new()
        .data(Data::from(b"carol may speak".to_vec()))
        .protocol(WriteProtocol {
            protocol: COMMUNITY.to_string(),
            protocol_path: "community/gatedChannel/participant".to_string(),
        })
        .parent_context_id(channel.context_id.as_ref().expect("should have context"))
        .recipient(CAROL_DID.as_str())
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, participant, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Carol writes a message invoking her participant role.
    // --------------------------------------------------
    let chat = WriteBuilder::new()
        .data(Data::from(b"hello channel".to_vec()))
        .protocol(WriteProtocol {
            protocol: COMMUNITY.to_string(),
            protocol_path: "community/gatedChannel/message".to_string(),
        })
        .parent_context_id(channel.context_id.as_ref().expect("should have context"))
        .protocol_role("community/gatedChannel/participant")
        .build(&carol_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, chat, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Mallory invokes the same role without holding it and is rejected.
    // --------------------------------------------------
    let chat = WriteBuilder::new()
        .data(Data::from(b"let me in".to_vec()))
        .protocol(WriteProtocol {
            protocol: COMMUNITY.to_string(),
            protocol_path: "community/gatedChannel/message".to_string(),
        })
        .parent_context_id(channel.context_id.as_ref().expect("should have context"))
        .protocol_role("community/gatedChannel/participant")
        .build(&mallory_keyring)
        .await
        .expect("should create write");

    let Err(Error::Unauthorized(e)) = endpoint::handle(&ALICE_DID, chat, &provider).await else {
        panic!("should be Unauthorized");
    };
    assert!(e.contains("no matching role record found"));
}

// A role anchored in one channel does not admit messages in another.
#[tokio::test]
async fn role_is_contextual() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let carol_keyring = provider.keyring(&CAROL_DID).expect("should get Carol's keyring");

    let configure = ConfigureBuilder::new()
        .definition(community_definition())
        .build(&alice_keyring)
        .await
        .expect("should build");
    endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");

    let community = WriteBuilder::new()
        .data(Data::from(b"the community".to_vec()))
        .protocol(WriteProtocol {
            protocol: COMMUNITY.to_string(),
            protocol_path: "community".to_string(),
        })
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, community.clone(), &provider).await.expect("should write");

    // two channels in the community
    let mut channels = vec![];
    for name in ["one", "two"] {
        let channel = WriteBuilder::new()
            .data(Data::from(name.as_bytes().to_vec()))
            .protocol(WriteProtocol {
                protocol: COMMUNITY.to_string(),
                protocol_path: "community/gatedChannel".to_string(),
            })
            .parent_context_id(community.context_id.as_ref().expect("should have context"))
            .build(&alice_keyring)
            .await
            .expect("should create write");
        endpoint::handle(&ALICE_DID, channel.clone(), &provider).await.expect("should write");
        channels.push(channel);
    }

    // Carol is a participant of the first channel only
    let participant = WriteBuilder::new()
        .data(Data::from(b"carol".to_vec()))
        .protocol(WriteProtocol {
            protocol: COMMUNITY.to_string(),
            protocol_path: "community/gatedChannel/participant".to_string(),
        })
        .parent_context_id(channels[0].context_id.as_ref().expect("should have context"))
        .recipient(CAROL_DID.as_str())
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, participant, &provider).await.expect("should write");

    // Carol may write in the first channel but not the second
    let chat = WriteBuilder::new()
        .data(Data::from(b"in bounds".to_vec()))
        .protocol(WriteProtocol {
            protocol: COMMUNITY.to_string(),
            protocol_path: "community/gatedChannel/message".to_string(),
        })
        .parent_context_id(channels[0].context_id.as_ref().expect("should have context"))
        .protocol_role("community/gatedChannel/participant")
        .build(&carol_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, chat, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let chat = WriteBuilder::new()
        .data(Data::from(b"out of bounds".to_vec()))
        .protocol(WriteProtocol {
            protocol: COMMUNITY.to_string(),
            protocol_path: "community/gatedChannel/message".to_string(),
        })
        .parent_context_id(channels[1].context_id.as_ref().expect("should have context"))
        .protocol_role("community/gatedChannel/participant")
        .build(&carol_keyring)
        .await
        .expect("should create write");
    let Err(Error::Unauthorized(_)) = endpoint::handle(&ALICE_DID, chat, &provider).await else {
        panic!("should be Unauthorized");
    };
}

// The author of an ancestor record may act where an `of` rule admits them.
#[tokio::test]
async fn ancestor_author_rule() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");
    let carol_keyring = provider.keyring(&CAROL_DID).expect("should get Carol's keyring");

    // anyone can create a post; the post's author can create replies
    let definition = Definition::new("http://forum.xyz")
        .add_type("post", ProtocolType::default())
        .add_type("reply", ProtocolType::default())
        .add_rule("post", RuleSet {
            actions: Some(vec![ActionRule {
                who: Some(Actor::Anyone),
                role: None,
                of: None,
                can: vec![Action::Create],
            }]),
            structure: [("reply".to_string(), RuleSet {
                actions: Some(vec![ActionRule {
                    who: Some(Actor::Author),
                    role: None,
                    of: Some("post".to_string()),
                    can: vec![Action::Create],
                }]),
                ..RuleSet::default()
            })]
            .into(),
            ..RuleSet::default()
        });

    let configure = ConfigureBuilder::new()
        .definition(definition)
        .build(&alice_keyring)
        .await
        .expect("should build");
    endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");

    // Bob creates a post on Alice's node
    let post = WriteBuilder::new()
        .data(Data::from(b"bob's post".to_vec()))
        .protocol(WriteProtocol {
            protocol: "http://forum.xyz".to_string(),
            protocol_path: "post".to_string(),
        })
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, post.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // Bob, the post's author, can reply
    let bob_reply = WriteBuilder::new()
        .data(Data::from(b"bob's reply".to_vec()))
        .protocol(WriteProtocol {
            protocol: "http://forum.xyz".to_string(),
            protocol_path: "post/reply".to_string(),
        })
        .parent_context_id(post.context_id.as_ref().expect("should have context"))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, bob_reply, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // Carol is not the post's author and cannot reply
    let carol_reply = WriteBuilder::new()
        .data(Data::from(b"carol's reply".to_vec()))
        .protocol(WriteProtocol {
            protocol: "http://forum.xyz".to_string(),
            protocol_path: "post/reply".to_string(),
        })
        .parent_context_id(post.context_id.as_ref().expect("should have context"))
        .build(&carol_keyring)
        .await
        .expect("should create write");
    let Err(Error::Unauthorized(_)) = endpoint::handle(&ALICE_DID, carol_reply, &provider).await
    else {
        panic!("should be Unauthorized");
    };

    // a query scoped to the protocol returns the post and reply to Alice
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().protocol("http://forum.xyz"))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    let body = reply.body.expect("should have body");
    assert_eq!(body.entries.expect("should have entries").len(), 2);
}
