use trainer::{
    TrainerErr,
    collective::{Collective, TcpGroup, broadcast_from_root},
};
use tokio::net::TcpListener;

#[tokio::test(flavor = "multi_thread")]
async fn tcp_group_reduces_and_synchronizes() {
    const WORLD_SIZE: usize = 3;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(async move {
        let group = TcpGroup::root(listener, WORLD_SIZE).await.unwrap();
        exercise(group).await
    }));

    for rank in 1..WORLD_SIZE {
        tasks.push(tokio::spawn(async move {
            let group = TcpGroup::peer(addr, rank, WORLD_SIZE).await.unwrap();
            exercise(group).await
        }));
    }

    for task in tasks {
        let (sum, broadcast) = task.await.unwrap();
        assert_eq!(sum, vec![3., 6., 0.5]);
        assert_eq!(broadcast, vec![42.; 2]);
    }
}

async fn exercise(mut group: TcpGroup) -> (Vec<f32>, Vec<f32>) {
    let rank = group.rank() as f32;

    let mut sum = vec![rank, 2. * rank, 0.5 * (rank == 0.) as u8 as f32];
    group.all_reduce_sum(&mut sum).await.unwrap();
    group.barrier().await.unwrap();

    let mut broadcast = vec![if rank == 0. { 42. } else { -1. }; 2];
    broadcast_from_root(&mut group, &mut broadcast).await.unwrap();

    group.close().await.unwrap();
    (sum, broadcast)
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_group_rejects_a_peer_from_another_world() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let root = tokio::spawn(async move { TcpGroup::root(listener, 2).await });
    let _peer = TcpGroup::peer(addr, 1, 3).await.unwrap();

    let err = root.await.unwrap().err().unwrap();
    assert!(matches!(err, TrainerErr::Collective { op: "join", .. }));
}
