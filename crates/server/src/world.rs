use std::collections::HashMap;

use bitflags::bitflags;
use glam::Vec3;

use outpost::{ObjectId, OutputBitStream, PlayerInput, StateMask, World, WorldDelta};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PawnField: u32 {
        const POSITION = 1 << 0;
        const VELOCITY = 1 << 1;
        const HEADING = 1 << 2;
    }
}

const MOVE_SPEED: f32 = 5.0;
const STEP_SECS: f32 = 1.0 / 30.0;

#[derive(Debug)]
struct Pawn {
    position: Vec3,
    velocity: Vec3,
    heading: f32,
}

/// Minimal authoritative world: one steerable pawn per player. Input
/// payloads are `[dx: i8, dz: i8]` steering, scaled the same way client
/// commands encode directions.
#[derive(Debug, Default)]
pub struct ArenaWorld {
    pawns: HashMap<ObjectId, Pawn>,
    by_player: HashMap<u32, ObjectId>,
    next_object_id: ObjectId,
}

impl ArenaWorld {
    pub fn new() -> Self {
        Self {
            next_object_id: 1,
            ..Self::default()
        }
    }

    pub fn pawn_count(&self) -> usize {
        self.pawns.len()
    }

    fn spawn_point(player_id: u32) -> Vec3 {
        let angle = player_id as f32 * std::f32::consts::FRAC_PI_4;
        Vec3::new(angle.cos() * 3.0, 1.0, angle.sin() * 3.0)
    }
}

fn decode_steering(payload: &[u8]) -> Option<Vec3> {
    if payload.len() < 2 {
        return None;
    }
    let dx = (payload[0] as i8) as f32 / 127.0;
    let dz = (payload[1] as i8) as f32 / 127.0;
    Some(Vec3::new(dx.clamp(-1.0, 1.0), 0.0, dz.clamp(-1.0, 1.0)))
}

impl World for ArenaWorld {
    fn spawn_player(&mut self, player_id: u32) -> (ObjectId, StateMask) {
        let object = self.next_object_id;
        self.next_object_id += 1;
        self.pawns.insert(
            object,
            Pawn {
                position: Self::spawn_point(player_id),
                velocity: Vec3::ZERO,
                heading: 0.0,
            },
        );
        self.by_player.insert(player_id, object);
        (object, PawnField::all().bits())
    }

    fn despawn_player(&mut self, player_id: u32, object: ObjectId) {
        self.pawns.remove(&object);
        self.by_player.remove(&player_id);
    }

    fn update(&mut self, inputs: &[PlayerInput], deltas: &mut Vec<WorldDelta>) {
        for input in inputs {
            let Some(object) = self.by_player.get(&input.player_id).copied() else {
                continue;
            };
            let Some(pawn) = self.pawns.get_mut(&object) else {
                continue;
            };

            let mut moved = false;
            for action in &input.actions {
                let Some(steer) = decode_steering(&action.payload) else {
                    continue;
                };
                pawn.velocity = steer * MOVE_SPEED;
                pawn.position += pawn.velocity * STEP_SECS;
                if steer.length_squared() > 0.0 {
                    pawn.heading = steer.x.atan2(steer.z);
                }
                moved = true;
            }

            if moved {
                deltas.push(WorldDelta::StateDirty {
                    object,
                    mask: (PawnField::POSITION | PawnField::VELOCITY | PawnField::HEADING).bits(),
                });
            }
        }
    }

    fn objects(&self, out: &mut Vec<(ObjectId, StateMask)>) {
        for object in self.pawns.keys() {
            out.push((*object, PawnField::all().bits()));
        }
    }

    fn write_state(&self, object: ObjectId, mask: StateMask, out: &mut OutputBitStream) {
        let Some(pawn) = self.pawns.get(&object) else {
            return;
        };
        let fields = PawnField::from_bits_truncate(mask);
        if fields.contains(PawnField::POSITION) {
            out.write_f32(pawn.position.x);
            out.write_f32(pawn.position.y);
            out.write_f32(pawn.position.z);
        }
        if fields.contains(PawnField::VELOCITY) {
            out.write_f32(pawn.velocity.x);
            out.write_f32(pawn.velocity.y);
            out.write_f32(pawn.velocity.z);
        }
        if fields.contains(PawnField::HEADING) {
            out.write_f32(pawn.heading);
        }
    }
}
