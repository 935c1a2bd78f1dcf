use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::FutureExt;
use rand::distributions::{Distribution, Standard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use memograph::{Context, Engine, Errors, Function, Invalidation};

const KEYS: u32 = 8;
const N_OPS: usize = 400;

type Table = Rc<RefCell<HashMap<u32, i64>>>;

/// A small function family over an external table, maintained with the
/// on-demand input pattern: every table write invalidates the leaf cell it
/// touches.
struct World {
    engine: Engine,
    table: Table,
    leaf: Function<u32, i64>,
    mid: Function<u32, i64>,
    top: Function<u32, i64>,
}

impl World {
    fn new() -> World {
        let _ = env_logger::builder().is_test(true).try_init();
        let engine = Engine::new();
        let table: Table = Rc::new(RefCell::new(HashMap::new()));

        let leaf = engine.function::<u32, i64>("leaf").cutoff_eq().build({
            let table = table.clone();
            move |_, k: u32| {
                let table = table.clone();
                async move { Ok(table.borrow().get(&k).copied().unwrap_or(0)) }.boxed_local()
            }
        });
        let mid = engine.function::<u32, i64>("mid").cutoff_eq().build({
            let leaf = leaf.clone();
            move |ctx: Context, k: u32| {
                let leaf = leaf.clone();
                async move { Ok(ctx.exec(&leaf, k).await? * 2) }.boxed_local()
            }
        });
        let top = engine.function::<u32, i64>("top").build({
            let mid = mid.clone();
            let leaf = leaf.clone();
            move |ctx: Context, k: u32| {
                let mid = mid.clone();
                let leaf = leaf.clone();
                async move {
                    let a = ctx.exec(&mid, k).await?;
                    let b = ctx.exec(&leaf, (k + 1) % KEYS).await?;
                    Ok(a + b)
                }
                .boxed_local()
            }
        });

        World {
            engine,
            table,
            leaf,
            mid,
            top,
        }
    }

    fn expected(&self, query: Query, key: u32) -> i64 {
        let table = self.table.borrow();
        let get = |k: u32| table.get(&k).copied().unwrap_or(0);
        match query {
            Query::Leaf => get(key),
            Query::Mid => get(key) * 2,
            Query::Top => get(key) * 2 + get((key + 1) % KEYS),
        }
    }

    fn demand(&self, f: &Function<u32, i64>, key: u32) -> Result<i64, Errors> {
        let f = f.clone();
        self.engine
            .run(move |ctx| async move { ctx.exec(&f, key).await })
    }
}

#[derive(Clone, Copy, Debug)]
enum Query {
    Leaf,
    Mid,
    Top,
}

#[derive(Debug)]
enum Op {
    Write(u32, i64),
    Read(Query, u32),
    Advance,
    ClearAll,
}

impl Distribution<Query> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Query {
        match rng.gen_range(0..3) {
            0 => Query::Leaf,
            1 => Query::Mid,
            _ => Query::Top,
        }
    }
}

impl Distribution<Op> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Op {
        match rng.gen_range(0..100) {
            0..=29 => Op::Write(rng.gen_range(0..KEYS), rng.gen_range(-50..50)),
            30..=89 => Op::Read(rng.gen(), rng.gen_range(0..KEYS)),
            90..=97 => Op::Advance,
            _ => Op::ClearAll,
        }
    }
}

impl Op {
    fn execute(self, world: &World) {
        match self {
            Op::Write(key, value) => {
                world.table.borrow_mut().insert(key, value);
                let cell = world.leaf.cell(key);
                world
                    .engine
                    .reset(cell.invalidate().with_reason("table write"));
            }
            Op::Read(query, key) => {
                let f = match query {
                    Query::Leaf => &world.leaf,
                    Query::Mid => &world.mid,
                    Query::Top => &world.top,
                };
                let got = world.demand(f, key).unwrap();
                assert_eq!(got, world.expected(query, key), "{:?}({})", query, key);
            }
            Op::Advance => world.engine.reset(Invalidation::empty()),
            Op::ClearAll => world.engine.reset(Invalidation::clear_caches()),
        }
    }
}

#[test]
fn stress_random_workload() {
    let world = World::new();
    world.engine.perf_counters().enable();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for key in 0..KEYS {
        world.table.borrow_mut().insert(key, key as i64);
    }

    let ops: Vec<Op> = (0..N_OPS).map(|_| rng.gen()).collect();
    for op in ops {
        op.execute(&world);
    }

    // Converged state: every query answers from the table.
    for key in 0..KEYS {
        for query in [Query::Leaf, Query::Mid, Query::Top] {
            let f = match query {
                Query::Leaf => &world.leaf,
                Query::Mid => &world.mid,
                Query::Top => &world.top,
            };
            assert_eq!(world.demand(f, key).unwrap(), world.expected(query, key));
        }
    }
    world.engine.perf_counters().assert_invariants();
}
