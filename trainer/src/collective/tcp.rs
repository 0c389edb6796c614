use std::{io, time::Duration};

use comms::{
    Wire,
    msg::{Command, Msg, Payload},
};
use log::{debug, info};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    time,
};

use super::Collective;
use crate::{Result, TrainerErr};

const CONNECT_ATTEMPTS: usize = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// One end of a connection between the root and a peer.
type Link = Wire<TcpStream>;

enum Role {
    /// Rank 0, holds a link to every other rank ordered by rank.
    Root(Vec<Link>),
    Peer(Link),
}

/// A process group over TCP with a star topology.
///
/// Rank 0 listens and every other rank connects to it. Reductions gather every contribution at
/// the root, which sums them and sends the result back. Barriers are a round of `Barrier` messages
/// answered with `Release` once the last one arrives.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl TcpGroup {
    /// Joins a group, listening on `addr` on rank 0 or connecting to it anywhere else.
    ///
    /// # Arguments
    /// * `addr` - The address of rank 0.
    /// * `rank` - This process' rank.
    /// * `world_size` - The amount of processes in the group.
    pub async fn join<A: ToSocketAddrs>(addr: A, rank: usize, world_size: usize) -> Result<Self> {
        if rank == 0 {
            let listener = TcpListener::bind(addr).await?;
            Self::root(listener, world_size).await
        } else {
            Self::peer(addr, rank, world_size).await
        }
    }

    /// Creates rank 0 of a group, waiting until every other rank joined.
    ///
    /// # Arguments
    /// * `listener` - Where the peers will connect to.
    /// * `world_size` - The amount of processes in the group.
    pub async fn root(listener: TcpListener, world_size: usize) -> Result<Self> {
        let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();

        for _ in 1..world_size {
            let (stream, addr) = listener.accept().await?;
            let mut link = Link::new(stream);

            let msg = link.recv().await?;
            let Msg::Control(Command::Join {
                rank,
                world_size: theirs,
            }) = msg
            else {
                return Err(TrainerErr::UnexpectedMessage {
                    op: "join",
                    got: msg.kind(),
                });
            };

            if theirs != world_size || rank == 0 || rank >= world_size {
                return Err(Self::join_err(format!(
                    "{addr} joined as rank {rank} of {theirs}, the group has {world_size}"
                )));
            }

            let slot = &mut slots[rank - 1];
            if slot.is_some() {
                return Err(Self::join_err(format!("rank {rank} joined twice")));
            }

            debug!("peer joined: rank={rank} addr={addr}");
            *slot = Some(link);
        }

        let links = slots.into_iter().flatten().collect();
        info!(world_size = world_size; "process group ready");

        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Root(links),
        })
    }

    /// Creates a non root rank of a group by connecting to rank 0.
    ///
    /// # Arguments
    /// * `addr` - The address of rank 0.
    /// * `rank` - This process' rank.
    /// * `world_size` - The amount of processes in the group.
    pub async fn peer<A: ToSocketAddrs>(addr: A, rank: usize, world_size: usize) -> Result<Self> {
        let stream = Self::connect(addr).await?;
        let mut link = Link::new(stream);

        let msg = Msg::Control(Command::Join { rank, world_size });
        link.send(&msg).await?;
        debug!(rank = rank; "joined process group");

        Ok(Self {
            rank,
            world_size,
            role: Role::Peer(link),
        })
    }

    /// Leaves the group, every rank should call it once it's done.
    pub async fn close(self) -> Result<()> {
        match self.role {
            Role::Root(mut links) => {
                for link in links.iter_mut() {
                    let msg = link.recv().await?;
                    if msg != Msg::Control(Command::Disconnect) {
                        return Err(TrainerErr::UnexpectedMessage {
                            op: "close",
                            got: msg.kind(),
                        });
                    }
                }
            }
            Role::Peer(mut link) => {
                link.send(&Msg::Control(Command::Disconnect)).await?;
            }
        }

        Ok(())
    }

    async fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpStream> {
        let mut last_err = None;

        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(&addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_err = Some(e);
                    time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }

        let e = last_err.unwrap_or_else(|| io::Error::other("no connection attempts were made"));
        Err(Self::join_err(format!("could not reach rank 0: {e}")))
    }

    fn join_err(detail: String) -> TrainerErr {
        TrainerErr::Collective { op: "join", detail }
    }

    fn length_err(got: usize, expected: usize) -> TrainerErr {
        TrainerErr::Collective {
            op: "all_reduce",
            detail: format!("buffer length mismatch, got {got}, expected {expected}"),
        }
    }
}

/// Maps a message that isn't the awaited one into an error.
fn unexpected(op: &'static str, msg: Msg) -> TrainerErr {
    match msg {
        Msg::Err(e) => TrainerErr::Collective {
            op,
            detail: e.into_owned(),
        },
        other => TrainerErr::UnexpectedMessage {
            op,
            got: other.kind(),
        },
    }
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_reduce_sum(&mut self, buf: &mut [f32]) -> Result<()> {
        match &mut self.role {
            Role::Root(links) => {
                for link in links.iter_mut() {
                    let msg = link.recv().await?;
                    let Msg::Data(Payload::Contribution(theirs)) = msg else {
                        return Err(unexpected("all_reduce", msg));
                    };

                    if theirs.len() != buf.len() {
                        return Err(Self::length_err(theirs.len(), buf.len()));
                    }

                    buf.iter_mut().zip(theirs).for_each(|(b, t)| *b += t);
                }

                let msg = Msg::Data(Payload::Reduced(buf));
                for link in links.iter_mut() {
                    link.send(&msg).await?;
                }
            }
            Role::Peer(link) => {
                link.send(&Msg::Data(Payload::Contribution(buf))).await?;

                let msg = link.recv().await?;
                let Msg::Data(Payload::Reduced(reduced)) = msg else {
                    return Err(unexpected("all_reduce", msg));
                };

                if reduced.len() != buf.len() {
                    return Err(Self::length_err(reduced.len(), buf.len()));
                }

                buf.copy_from_slice(reduced);
            }
        }

        Ok(())
    }

    async fn barrier(&mut self) -> Result<()> {
        match &mut self.role {
            Role::Root(links) => {
                for link in links.iter_mut() {
                    let msg = link.recv().await?;
                    if msg != Msg::Control(Command::Barrier) {
                        return Err(unexpected("barrier", msg));
                    }
                }

                let msg = Msg::Control(Command::Release);
                for link in links.iter_mut() {
                    link.send(&msg).await?;
                }
            }
            Role::Peer(link) => {
                link.send(&Msg::Control(Command::Barrier)).await?;

                let msg = link.recv().await?;
                if msg != Msg::Control(Command::Release) {
                    return Err(unexpected("barrier", msg));
                }
            }
        }

        Ok(())
    }
}
