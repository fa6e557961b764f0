mod common;

use cohort_back::{
    dto::participant::{ReadyStatus, RegistrationStatus},
    services::{admin_service, participant_service},
};
use common::Engine;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_seat_lobby_admits_exactly_one() {
    let engine = Engine::boot().await;
    let batch_id = engine.create_batch(1, 1).await;
    let game_id = engine.games_of(&batch_id).await.remove(0);
    let round = admin_service::add_round(&engine.state, game_id.clone(), Default::default())
        .await
        .unwrap()
        .id;
    admin_service::add_stage(
        &engine.state,
        round,
        serde_json::from_str(r#"{"name": "play", "durationSeconds": 60}"#).unwrap(),
    )
    .await
    .unwrap();
    admin_service::start_batch(&engine.state, batch_id.clone()).await.unwrap();
    engine.wait_for(&batch_id, "status", "running").await;

    let mut players = Vec::new();
    for index in 0..8 {
        let registration = participant_service::register(&engine.state, format!("p{index}"))
            .await
            .unwrap();
        assert_eq!(registration.status, RegistrationStatus::Queued);
        players.push(registration.player_id);
    }

    let handles: Vec<_> = players
        .iter()
        .cloned()
        .map(|player_id| {
            let state = engine.state.clone();
            tokio::spawn(async move { participant_service::ready(&state, player_id).await })
        })
        .collect();
    let mut admitted = Vec::new();
    for (player_id, handle) in players.iter().zip(handles) {
        let response = handle.await.unwrap().unwrap();
        match response.status {
            ReadyStatus::Admitted => admitted.push(player_id.clone()),
            ReadyStatus::LobbyFull => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(admitted.len(), 1);

    engine.wait_for(&game_id, "status", "running").await;
    let lobby_id = engine.attr(&game_id, "lobbyID").await.unwrap();
    let roster = engine.state.store().await.get_strings(&lobby_id, "playerIds");
    assert_eq!(roster, admitted);

    for player_id in players.iter().filter(|id| !admitted.contains(id)) {
        engine.wait_for(player_id, "exitStatus", "gameFull").await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn returning_participant_reuses_their_player() {
    let engine = Engine::boot().await;
    let batch_id = engine.create_batch(1, 3).await;

    let first = participant_service::register(&engine.state, "dana".into())
        .await
        .unwrap();
    assert_eq!(first.status, RegistrationStatus::NoExperimentAvailable);
    assert!(first.lobby_id.is_none());
    engine.wait_for(&first.player_id, "participantID", "dana").await;

    admin_service::start_batch(&engine.state, batch_id.clone()).await.unwrap();
    engine.wait_for(&batch_id, "status", "running").await;

    let second = participant_service::register(&engine.state, "dana".into())
        .await
        .unwrap();
    assert_eq!(second.status, RegistrationStatus::Queued);
    assert_eq!(second.player_id, first.player_id);
    let lobby_id = second.lobby_id.clone().unwrap();
    engine.wait_for(&second.player_id, "lobbyID", &lobby_id).await;

    let third = participant_service::register(&engine.state, "dana".into())
        .await
        .unwrap();
    assert_eq!(third.status, RegistrationStatus::Reused);
    assert_eq!(third.lobby_id, Some(lobby_id));
}
