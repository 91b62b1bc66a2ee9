use std::net::{self as stdnet, SocketAddr};

use log::{debug, info, warn};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::{Builder, Runtime},
};

use crate::{
    Collective, CommErr, OnoReceiver, OnoSender, ReduceOp, Result, channel, check_scatter,
    msg::{Command, Msg, OpKind},
};

struct Link {
    rx: OnoReceiver<OwnedReadHalf>,
    tx: OnoSender<OwnedWriteHalf>,
}

impl Link {
    fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = channel(rx, tx);
        Ok(Self { rx, tx })
    }
}

enum Role {
    /// Rank 0, holds one link per remaining rank, indexed by `rank - 1`.
    Hub(Vec<Link>),
    Spoke(Link),
}

/// A group of workers connected over tcp.
///
/// Rank 0 hosts the group and every other rank connects to it. Each collective
/// is funneled through the hub: spokes announce the collective, send their
/// contribution and wait for the hub's reply. The blocking `Collective` api is
/// served by a private single threaded runtime.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Role,
    buf: Vec<f32>,
    runtime: Runtime,
}

impl TcpGroup {
    /// Hosts a new group as rank 0 and waits for the rest of the workers to join.
    ///
    /// # Arguments
    /// * `listener` - A bound listener the remaining ranks will connect to.
    /// * `world_size` - The amount of workers in the group, including this one.
    ///
    /// # Returns
    /// The hub's handle on the group once every rank has joined.
    pub fn host(listener: stdnet::TcpListener, world_size: usize) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        listener.set_nonblocking(true)?;

        let mut buf = Vec::new();
        let links = runtime.block_on(async {
            let listener = TcpListener::from_std(listener)?;
            let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();

            for _ in 1..world_size {
                let (stream, addr) = listener.accept().await?;
                let mut link = Link::new(stream)?;

                let rank = match link.rx.recv_into(&mut buf).await? {
                    Msg::Control(Command::Hello {
                        rank,
                        world_size: theirs,
                    }) if theirs == world_size && (1..world_size).contains(&rank) => rank,
                    other => return Err(CommErr::UnexpectedMessage { got: other.kind() }),
                };

                if slots[rank - 1].is_some() {
                    return Err(CommErr::UnexpectedMessage {
                        got: "control/hello",
                    });
                }

                debug!(rank = rank; "worker joined from {addr}");
                slots[rank - 1] = Some(link);
            }

            slots
                .into_iter()
                .enumerate()
                .map(|(i, link)| link.ok_or(CommErr::Disconnected { rank: i + 1 }))
                .collect::<Result<Vec<_>>>()
        })?;

        info!("group of {world_size} workers is up");

        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Hub(links),
            buf,
            runtime,
        })
    }

    /// Joins the group hosted at `addr`.
    ///
    /// # Arguments
    /// * `addr` - The hub's address.
    /// * `rank` - This worker's rank, must be in `1..world_size`.
    /// * `world_size` - The amount of workers in the group.
    pub fn join(addr: SocketAddr, rank: usize, world_size: usize) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;

        let link = runtime.block_on(async {
            let stream = TcpStream::connect(addr).await?;
            let mut link = Link::new(stream)?;

            let hello = Msg::Control(Command::Hello { rank, world_size });
            link.tx.send(&hello).await?;
            Ok::<_, CommErr>(link)
        })?;

        debug!(rank = rank; "joined group hosted at {addr}");

        Ok(Self {
            rank,
            world_size,
            role: Role::Spoke(link),
            buf: Vec::new(),
            runtime,
        })
    }

    /// Runs one collective through the hub.
    ///
    /// # Returns
    /// The hub's combined tensor, or this rank's slice of it for `reduce_scatter`.
    fn exchange(&mut self, kind: OpKind, input: &[f32]) -> Result<Vec<f32>> {
        let Self {
            rank,
            role,
            buf,
            runtime,
            ..
        } = self;

        match role {
            Role::Hub(links) => runtime.block_on(async {
                match serve(links, buf, kind, input).await {
                    Ok(out) => Ok(out),
                    Err(e) => {
                        warn!("collective {} failed at the hub: {e}", kind.name());
                        let reason = e.to_string();
                        for link in links.iter_mut() {
                            let _ = link.tx.send(&Msg::Err(reason.as_str().into())).await;
                        }

                        Err(e)
                    }
                }
            }),
            Role::Spoke(link) => runtime.block_on(async {
                let header = Msg::Control(Command::Collective {
                    kind,
                    len: input.len(),
                });

                link.tx.send(&header).await?;
                link.tx.send(&Msg::Data(input)).await?;

                match link.rx.recv_into(buf).await? {
                    Msg::Data(nums) => Ok(nums.to_vec()),
                    Msg::Err(e) => {
                        warn!("rank {rank} got an error from the hub: {e}");
                        Err(CommErr::Remote(e.into_owned()))
                    }
                    other => Err(CommErr::UnexpectedMessage { got: other.kind() }),
                }
            }),
        }
    }
}

/// Collects every spoke's contribution, combines them and replies.
async fn serve(
    links: &mut [Link],
    buf: &mut Vec<f32>,
    kind: OpKind,
    input: &[f32],
) -> Result<Vec<f32>> {
    let len = input.len();
    let mut acc = input.to_vec();

    for (i, link) in links.iter_mut().enumerate() {
        match link.rx.recv_into(buf).await? {
            Msg::Control(Command::Collective { kind: got, .. }) if got != kind => {
                return Err(CommErr::Desync {
                    expected: kind.name(),
                    got: got.name(),
                });
            }
            Msg::Control(Command::Collective { len: got, .. }) if got != len => {
                return Err(CommErr::ShapeMismatch {
                    op: kind.name(),
                    got,
                    expected: len,
                });
            }
            Msg::Control(Command::Collective { .. }) => {}
            Msg::Control(Command::Disconnect) => {
                return Err(CommErr::Disconnected { rank: i + 1 });
            }
            other => return Err(CommErr::UnexpectedMessage { got: other.kind() }),
        }

        let data = match link.rx.recv_into(buf).await? {
            Msg::Data(nums) if nums.len() == len => nums,
            Msg::Data(nums) => {
                return Err(CommErr::ShapeMismatch {
                    op: kind.name(),
                    got: nums.len(),
                    expected: len,
                });
            }
            other => return Err(CommErr::UnexpectedMessage { got: other.kind() }),
        };

        match kind {
            OpKind::AllGather => acc.extend_from_slice(data),
            OpKind::ReduceScatter { op, .. } | OpKind::AllReduce { op } => acc
                .iter_mut()
                .zip(data)
                .for_each(|(a, v)| *a = op.apply(*a, *v)),
        }
    }

    let chunk = match kind {
        OpKind::ReduceScatter { shard_count, .. } => len / shard_count,
        _ => acc.len(),
    };

    for (i, link) in links.iter_mut().enumerate() {
        let reply = match kind {
            OpKind::ReduceScatter { .. } => &acc[(i + 1) * chunk..(i + 2) * chunk],
            _ => &acc[..],
        };

        link.tx.send(&Msg::Data(reply)).await?;
    }

    acc.truncate(chunk);
    Ok(acc)
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&mut self, shard: &[f32]) -> Result<Vec<f32>> {
        let full = self.exchange(OpKind::AllGather, shard)?;
        let expected = shard.len() * self.world_size;
        if full.len() != expected {
            return Err(CommErr::ShapeMismatch {
                op: "all_gather",
                got: full.len(),
                expected,
            });
        }

        Ok(full)
    }

    fn reduce_scatter(
        &mut self,
        op: ReduceOp,
        input: &[f32],
        shard_count: usize,
    ) -> Result<Vec<f32>> {
        check_scatter(input.len(), shard_count, self.world_size)?;
        self.exchange(OpKind::ReduceScatter { op, shard_count }, input)
    }

    fn all_reduce(&mut self, op: ReduceOp, values: &mut [f32]) -> Result<()> {
        let reduced = self.exchange(OpKind::AllReduce { op }, values)?;
        if reduced.len() != values.len() {
            return Err(CommErr::ShapeMismatch {
                op: "all_reduce",
                got: reduced.len(),
                expected: values.len(),
            });
        }

        values.copy_from_slice(&reduced);
        Ok(())
    }
}

impl Drop for TcpGroup {
    fn drop(&mut self) {
        let Self { role, runtime, .. } = self;
        if let Role::Spoke(link) = role {
            let bye = Msg::Control(Command::Disconnect);
            if let Err(e) = runtime.block_on(link.tx.send(&bye)) {
                debug!("failed to say goodbye to the hub: {e}");
            }
        }
    }
}
